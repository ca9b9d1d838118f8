/*
An in-process transport simulating the remote service.

This backs the demo binary and the test suite: it validates secrets
against a small key registry, records every transport operation in an
ordered event log, and lets callers inject inbound commands the way an
operator would send them from the service side.
*/

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;

use crate::credential::Credential;

use super::{AckError, ConnectError, InboundCommand, SendError, Transport};

/// One recorded transport operation, in occurrence order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connected { key: String },
    Closed { key: String },
    Sent(Vec<u8>),
    Acknowledged(String),
}

#[derive(Debug)]
pub struct SimHandle {
    id: u64,
    key: String,
}

#[derive(Default)]
struct Inner {
    // None accepts any non-empty key, mimicking a permissive remote
    accepted_keys: Mutex<Option<HashSet<String>>>,
    connect_delay: Mutex<Duration>,
    fail_sends: AtomicBool,
    next_handle_id: AtomicU64,
    events: Mutex<Vec<Event>>,
    // every injected command stays outstanding until acknowledged, and
    // outstanding commands are redelivered in order on each subscribe;
    // this mirrors the at-least-once contract of a real remote
    outstanding: Mutex<VecDeque<InboundCommand>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<InboundCommand>>>,
}

#[derive(Clone, Default)]
pub struct SimTransport {
    inner: Arc<Inner>,
}

impl SimTransport {
    /// A transport that accepts any non-empty secret key
    pub fn accepting_any() -> Self {
        Self::default()
    }

    /// A transport that only accepts the given secret keys
    pub fn with_accepted_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let transport = Self::default();
        *transport.inner.accepted_keys.lock().unwrap() =
            Some(keys.into_iter().map(Into::into).collect());
        transport
    }

    /// Register an additional accepted key, as a remote does when a
    /// rotation has been scheduled on the service side
    pub fn accept_key<K: Into<String>>(&self, key: K) {
        let mut accepted = self.inner.accepted_keys.lock().unwrap();
        if let Some(keys) = accepted.as_mut() {
            keys.insert(key.into());
        }
    }

    /// Delay every connect attempt, simulating a slow remote
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock().unwrap() = delay;
    }

    /// Make every send fail, simulating a flaky link
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Deliver a command to the device, like the remote service would
    pub fn inject(&self, command: InboundCommand) {
        self.inner
            .outstanding
            .lock()
            .unwrap()
            .push_back(command.clone());

        let subscriber = self.inner.subscriber.lock().unwrap();
        if let Some(tx) = subscriber.as_ref() {
            let _ = tx.send(command);
        } else {
            debug!(id = %command.id, "no subscriber, command waits for redelivery");
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn handles_opened(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Connected { .. }))
            .count()
    }

    pub fn handles_closed(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Closed { .. }))
            .count()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sent(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Acknowledged(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.inner.events.lock().unwrap().push(event);
    }
}

impl Transport for SimTransport {
    type Handle = SimHandle;

    async fn connect(&self, credential: &Credential) -> Result<SimHandle, ConnectError> {
        let delay = *self.inner.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }

        if !credential.is_initialized() {
            return Err(ConnectError::Refused("credential is not initialized".into()));
        }

        let key = credential.secret_key.to_string();
        {
            let accepted = self.inner.accepted_keys.lock().unwrap();
            if let Some(keys) = accepted.as_ref()
                && !keys.contains(&key)
            {
                return Err(ConnectError::Refused(format!(
                    "unauthorized key for device '{}'",
                    credential.device_id
                )));
            }
        }

        let id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, "sim transport connected");
        self.record(Event::Connected { key: key.clone() });
        Ok(SimHandle { id, key })
    }

    async fn close(&self, handle: SimHandle) {
        debug!(id = handle.id, "sim transport closed");
        // end the session's command stream; anything injected from here
        // on waits for the next subscriber
        self.inner.subscriber.lock().unwrap().take();
        self.record(Event::Closed { key: handle.key });
    }

    async fn send(&self, _handle: &SimHandle, payload: &[u8]) -> Result<(), SendError> {
        if self.inner.fail_sends.load(Ordering::Relaxed) {
            return Err(SendError("simulated link failure".into()));
        }
        self.record(Event::Sent(payload.to_vec()));
        Ok(())
    }

    fn subscribe(&self, _handle: &SimHandle) -> mpsc::UnboundedReceiver<InboundCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        // redeliver everything still unacknowledged, oldest first
        for command in self.inner.outstanding.lock().unwrap().iter() {
            // an unbounded send only fails if rx is dropped, which can't
            // happen while we hold it
            let _ = tx.send(command.clone());
        }
        *self.inner.subscriber.lock().unwrap() = Some(tx);
        rx
    }

    async fn acknowledge(&self, _handle: &SimHandle, command_id: &str) -> Result<(), AckError> {
        self.inner
            .outstanding
            .lock()
            .unwrap()
            .retain(|command| command.id != command_id);
        self.record(Event::Acknowledged(command_id.to_owned()));
        Ok(())
    }
}
