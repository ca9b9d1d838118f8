/*
The transport capability the agent talks to the remote service with.

Opening sockets, TLS and protocol framing are external collaborators;
this module only defines the seam. Inbound commands are delivered
through an ordered queue obtained from [`Transport::subscribe`] rather
than a fire-and-forget callback, so the consumer fully controls
processing order and acknowledgment.
*/

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::credential::Credential;

pub mod sim;

/// A message delivered from the remote service to the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundCommand {
    pub id: String,
    pub attributes: HashMap<String, String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connect timed out")]
    Timeout,
}

#[derive(Debug, Error)]
#[error("transport rejected send: {0}")]
pub struct SendError(pub String);

#[derive(Debug, Error)]
#[error("transport rejected acknowledgment: {0}")]
pub struct AckError(pub String);

/// One live session with the remote service.
///
/// A handle is bound to the credential used to establish it. At most
/// one handle is active at any time; the connection supervisor closes
/// the previous one before opening a replacement.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Handle;

    /// Establish a session authenticated with the given credential
    async fn connect(&self, credential: &Credential) -> Result<Self::Handle, ConnectError>;

    /// Close a session, blocking until it is fully torn down
    async fn close(&self, handle: Self::Handle);

    /// Transmit one message over the session
    async fn send(&self, handle: &Self::Handle, payload: &[u8]) -> Result<(), SendError>;

    /// Start receiving inbound commands on the session.
    ///
    /// Commands are delivered in the order the remote sends them.
    /// Commands arriving while no subscription is active are redelivered
    /// to the next subscriber.
    fn subscribe(&self, handle: &Self::Handle) -> mpsc::UnboundedReceiver<InboundCommand>;

    /// Mark a command as consumed.
    ///
    /// Unacknowledged commands may be redelivered after an unbounded
    /// delay; each command must be acknowledged exactly once.
    async fn acknowledge(&self, handle: &Self::Handle, command_id: &str) -> Result<(), AckError>;
}
