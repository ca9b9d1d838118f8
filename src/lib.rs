/*
Device agent demonstrating remote credential rotation.

The agent holds one logical connection to a remote service, sends
telemetry on a fixed interval and listens for inbound commands. A
command carrying a `deviceKey` attribute triggers a rotation: the new
secret is persisted first, then the connection is torn down and
re-established with the rotated credential.

The transport itself (sockets, TLS, protocol framing) is an external
collaborator behind the [`transport::Transport`] trait; this crate only
owns the rotation/reconnect state machine and its concurrency
guarantees.
*/

pub mod cli;
pub mod credential;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod util;
