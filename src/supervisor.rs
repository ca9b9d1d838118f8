/*
The connection supervisor owns the single logical connection to the
remote service and executes the rotate-and-reconnect protocol.

Two concurrent activities touch it: the telemetry loop calling
[`ConnectionSupervisor::send`] and the command loop in
[`ConnectionSupervisor::run`]. The active handle lives in a mutex-held
slot so a send either completes against the current handle before a
rotation tears it down, or fails fast while the rotation is in flight.
*/

use std::mem;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::credential::{Credential, CredentialStore, CredentialStoreError};
use crate::transport::{self, ConnectError, InboundCommand, Transport};

/// The inbound command attribute carrying a new secret key.
///
/// A command with this attribute is a rotation request; its value is
/// the replacement key. Any other attributes are logged and ignored.
pub const ROTATION_KEY_ATTRIBUTE: &str = "deviceKey";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Rotating,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    Disconnected,

    #[error("credential rotation in progress")]
    Rotating,

    #[error("send timed out")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] transport::SendError),
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("failed to persist rotated credential: {0}")]
    Persist(#[from] CredentialStoreError),

    #[error("failed to reconnect with rotated credential: {0}")]
    Reconnect(#[from] ConnectError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("credential rotation failed: {0}")]
    Rotation(#[from] RotationError),
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Bound on connect attempts, including the reconnect in a rotation
    pub connect_timeout: Duration,

    /// Bound on a single send or acknowledge call
    pub send_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(10_000),
            send_timeout: Duration::from_millis(5_000),
        }
    }
}

enum Conn<H> {
    Disconnected,
    Connected(H),
    // the previous handle has been taken for teardown and no
    // replacement is active yet; sends fail fast in this state
    Rotating,
}

struct Inner<H> {
    credential: Credential,
    conn: Conn<H>,
}

pub struct ConnectionSupervisor<T: Transport> {
    transport: T,
    store: CredentialStore,
    config: SupervisorConfig,
    inner: Mutex<Inner<T::Handle>>,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(
        transport: T,
        store: CredentialStore,
        credential: Credential,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            inner: Mutex::new(Inner {
                credential,
                conn: Conn::Disconnected,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        match self.inner.lock().await.conn {
            Conn::Disconnected => ConnectionState::Disconnected,
            Conn::Connected(_) => ConnectionState::Connected,
            Conn::Rotating => ConnectionState::Rotating,
        }
    }

    /// The credential currently in use
    pub async fn credential(&self) -> Credential {
        self.inner.lock().await.credential.clone()
    }

    /// Establish the connection and start listening for inbound
    /// commands, using the credential the supervisor was created with.
    ///
    /// Returns the command stream to pass to [`ConnectionSupervisor::run`].
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<InboundCommand>, ConnectError> {
        let credential = self.credential().await;
        let handle = self.connect(&credential).await?;
        let commands = self.transport.subscribe(&handle);

        let mut guard = self.inner.lock().await;
        guard.conn = Conn::Connected(handle);
        info!(
            device = %credential.device_id,
            host = %credential.host_endpoint,
            "connected"
        );
        Ok(commands)
    }

    /// Transmit one message over the active connection.
    ///
    /// Fails fast while a rotation is in flight; callers should treat
    /// that as transient, not fatal.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        let guard = self.inner.lock().await;
        let handle = match &guard.conn {
            Conn::Connected(handle) => handle,
            Conn::Rotating => return Err(SendError::Rotating),
            Conn::Disconnected => return Err(SendError::Disconnected),
        };

        // the handle slot stays locked for the duration of the send, so
        // a rotation cannot tear the handle down mid-transmission; the
        // timeout keeps a stuck transport from blocking rotation forever
        match timeout(self.config.send_timeout, self.transport.send(handle, payload)).await {
            Ok(res) => res.map_err(SendError::from),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Process inbound commands until shutdown.
    ///
    /// Commands are consumed strictly one at a time in delivery order
    /// and acknowledged before any further action, satisfying the
    /// remote's ordering contract. A failed rotation is fatal and is
    /// returned to the caller; no retry is attempted here.
    #[instrument(name = "supervisor", skip_all)]
    pub async fn run(
        &self,
        mut commands: mpsc::UnboundedReceiver<InboundCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        loop {
            tokio::select! {
                maybe_command = commands.recv() => {
                    let Some(command) = maybe_command else {
                        warn!("command stream closed by transport");
                        return Ok(());
                    };
                    if let Some(stream) = self.handle_command(command).await? {
                        // a rotation replaced the connection; listen on
                        // the new session's stream from here on
                        commands = stream;
                    }
                }
                res = shutdown.changed() => {
                    // a closed shutdown channel means the process is
                    // going away; treat it the same as a signal
                    if res.is_err() || *shutdown.borrow() {
                        debug!("shutdown requested, leaving command loop");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Close the active connection, if any; idempotent.
    pub async fn stop(&self) {
        let previous = {
            let mut guard = self.inner.lock().await;
            mem::replace(&mut guard.conn, Conn::Disconnected)
        };
        if let Conn::Connected(handle) = previous {
            self.transport.close(handle).await;
            info!("disconnected");
        }
    }

    async fn handle_command(
        &self,
        command: InboundCommand,
    ) -> Result<Option<mpsc::UnboundedReceiver<InboundCommand>>, SupervisorError> {
        info!(id = %command.id, "received command");

        // Acknowledge before anything else: unacknowledged commands may
        // be redelivered after an unbounded delay, so the ack must land
        // before any step that could block or tear the connection down.
        {
            let guard = self.inner.lock().await;
            let Conn::Connected(handle) = &guard.conn else {
                warn!(id = %command.id, "dropping command received while not connected");
                return Ok(None);
            };
            let ack = timeout(
                self.config.send_timeout,
                self.transport.acknowledge(handle, &command.id),
            )
            .await;
            match ack {
                Ok(Ok(())) => debug!(id = %command.id, "acknowledged"),
                Ok(Err(err)) => {
                    // not acknowledged, so the transport will redeliver;
                    // nothing may run before a successful ack
                    warn!(id = %command.id, "failed to acknowledge command: {err}");
                    return Ok(None);
                }
                Err(_) => {
                    warn!(id = %command.id, "acknowledge timed out");
                    return Ok(None);
                }
            }
        }

        if let Some(new_key) = command.attributes.get(ROTATION_KEY_ATTRIBUTE) {
            info!(id = %command.id, "command carries a new device key, rotating");
            let stream = self.rotate(new_key).await?;
            return Ok(Some(stream));
        }

        for (key, value) in &command.attributes {
            debug!(id = %command.id, "attribute {key}={value}");
        }
        debug!(
            id = %command.id,
            payload = %String::from_utf8_lossy(&command.payload),
            "ignoring command without a rotation attribute"
        );
        Ok(None)
    }

    /// Rotate to a new secret key and reconnect.
    ///
    /// Strictly ordered: persist, close, connect, resubscribe. The new
    /// key is durable before the old handle goes away, so a crash
    /// mid-rotation recovers by reconnecting with the key the remote
    /// already considers current, never a stale one.
    #[instrument(skip_all, err)]
    async fn rotate(
        &self,
        new_key: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundCommand>, RotationError> {
        // Step 1: persist. A failure here aborts the rotation with the
        // old connection untouched.
        let rotated = {
            let guard = self.inner.lock().await;
            guard.credential.with_secret_key(new_key)
        };
        self.store.persist(&rotated).await?;

        // Step 2: take the handle out. From here until reconnect
        // completes, sends observe `Rotating` and fail fast.
        let previous = {
            let mut guard = self.inner.lock().await;
            guard.credential = rotated.clone();
            mem::replace(&mut guard.conn, Conn::Rotating)
        };
        if let Conn::Connected(handle) = previous {
            debug!("closing connection");
            self.transport.close(handle).await;
        }

        // Steps 3 and 4: reconnect with the rotated credential and
        // re-register the command listener on the new session
        match self.connect(&rotated).await {
            Ok(handle) => {
                let commands = self.transport.subscribe(&handle);
                let mut guard = self.inner.lock().await;
                guard.conn = Conn::Connected(handle);
                info!("reconnected with rotated credential");
                Ok(commands)
            }
            Err(err) => {
                let mut guard = self.inner.lock().await;
                guard.conn = Conn::Disconnected;
                Err(err.into())
            }
        }
    }

    async fn connect(&self, credential: &Credential) -> Result<T::Handle, ConnectError> {
        match timeout(
            self.config.connect_timeout,
            self.transport.connect(credential),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(ConnectError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    use crate::transport::sim::{Event, SimTransport};

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn rotation_command(id: &str, key: &str) -> InboundCommand {
        InboundCommand {
            id: id.to_owned(),
            attributes: [(ROTATION_KEY_ATTRIBUTE.to_owned(), key.to_owned())].into(),
            payload: b"rotate".to_vec(),
        }
    }

    fn plain_command(id: &str) -> InboundCommand {
        InboundCommand {
            id: id.to_owned(),
            attributes: [("note".to_owned(), "hello".to_owned())].into(),
            payload: b"{}".to_vec(),
        }
    }

    struct Harness {
        transport: SimTransport,
        supervisor: Arc<ConnectionSupervisor<SimTransport>>,
        store: CredentialStore,
        shutdown_tx: watch::Sender<bool>,
        // keeps the backing directory alive for the test's duration
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(transport: SimTransport) -> Self {
            Self::with_config(transport, SupervisorConfig::default()).await
        }

        async fn with_config(transport: SimTransport, config: SupervisorConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = CredentialStore::new(dir.path().join("credential.json"));
            let credential = Credential::new("dev1", "hub.example", "K0");
            store.persist(&credential).await.unwrap();

            let supervisor = Arc::new(ConnectionSupervisor::new(
                transport.clone(),
                store.clone(),
                credential,
                config,
            ));
            let (shutdown_tx, _) = watch::channel(false);

            Self {
                transport,
                supervisor,
                store,
                shutdown_tx,
                _dir: dir,
            }
        }

        /// Start the supervisor and spawn its command loop
        async fn spawn_run(&self) -> JoinHandle<Result<(), SupervisorError>> {
            let commands = self.supervisor.start().await.unwrap();
            let supervisor = Arc::clone(&self.supervisor);
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move { supervisor.run(commands, shutdown).await })
        }

        async fn wait_for_acks(&self, count: usize) {
            let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
            while self.transport.acknowledged().len() < count {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {count} acknowledgments, got {:?}",
                    self.transport.acknowledged()
                );
                sleep(Duration::from_millis(5)).await;
            }
        }

        async fn wait_for_state(&self, state: ConnectionState) {
            let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
            while self.supervisor.state().await != state {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for state {state:?}"
                );
                sleep(Duration::from_millis(5)).await;
            }
        }

        /// Wait until `count` handles have been opened, i.e. until the
        /// reconnect step of a rotation has completed
        async fn wait_for_opened(&self, count: usize) {
            let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
            while self.transport.handles_opened() < count {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {count} opened handles, got {:?}",
                    self.transport.events()
                );
                sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[tokio::test]
    async fn start_connects_and_send_delivers_payloads() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let _commands = harness.supervisor.start().await.unwrap();

        assert_eq!(harness.supervisor.state().await, ConnectionState::Connected);
        harness.supervisor.send(b"tick").await.unwrap();

        assert_eq!(harness.transport.sent(), vec![b"tick".to_vec()]);
        assert_eq!(harness.transport.handles_opened(), 1);
    }

    #[tokio::test]
    async fn send_fails_while_disconnected() {
        let harness = Harness::new(SimTransport::accepting_any()).await;

        let err = harness.supervisor.send(b"tick").await.unwrap_err();
        assert!(matches!(err, SendError::Disconnected));
    }

    #[tokio::test]
    async fn start_fails_when_the_remote_refuses_the_credential() {
        let harness = Harness::new(SimTransport::with_accepted_keys(["other"])).await;

        let err = harness.supervisor.start().await.unwrap_err();
        assert!(matches!(err, ConnectError::Refused(_)));
        assert_eq!(
            harness.supervisor.state().await,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn start_times_out_against_a_stuck_remote() {
        let transport = SimTransport::accepting_any();
        transport.set_connect_delay(Duration::from_millis(500));
        let harness = Harness::with_config(
            transport,
            SupervisorConfig {
                connect_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await;

        let err = harness.supervisor.start().await.unwrap_err();
        assert!(matches!(err, ConnectError::Timeout));
    }

    #[tokio::test]
    async fn rotation_acknowledges_then_replaces_the_connection() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let task = harness.spawn_run().await;

        harness.transport.inject(rotation_command("m1", "K1"));
        harness.wait_for_opened(2).await;

        // persisted credential carries the new key, other fields untouched
        let persisted = harness.store.load().await.unwrap();
        assert_eq!(persisted, Credential::new("dev1", "hub.example", "K1"));

        // exactly one old handle closed, one new handle opened with the
        // new key, and the ack landed before the close began
        let events = harness.transport.events();
        assert_eq!(
            events,
            vec![
                Event::Connected { key: "K0".into() },
                Event::Acknowledged("m1".into()),
                Event::Closed { key: "K0".into() },
                Event::Connected { key: "K1".into() },
            ]
        );

        harness.shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn active_handles_equal_one_plus_successful_rotations() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let task = harness.spawn_run().await;

        harness.transport.inject(rotation_command("m1", "K1"));
        harness.transport.inject(rotation_command("m2", "K2"));
        harness.wait_for_opened(3).await;

        assert_eq!(harness.transport.handles_opened(), 3);
        assert_eq!(harness.transport.handles_closed(), 2);

        harness.shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // shutdown closes the last handle; no leaks
        harness.supervisor.stop().await;
        assert_eq!(harness.transport.handles_closed(), 3);
    }

    #[tokio::test]
    async fn rotating_twice_with_the_same_key_is_idempotent() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let task = harness.spawn_run().await;

        harness.transport.inject(rotation_command("m1", "K1"));
        harness.wait_for_opened(2).await;
        let after_first = harness.store.load().await.unwrap();

        harness.transport.inject(rotation_command("m2", "K1"));
        harness.wait_for_opened(3).await;
        harness.wait_for_state(ConnectionState::Connected).await;

        assert_eq!(harness.store.load().await.unwrap(), after_first);
        assert_eq!(
            harness.supervisor.credential().await.secret_key,
            "K1".into()
        );

        harness.shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commands_are_acknowledged_in_delivery_order() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let task = harness.spawn_run().await;

        harness.transport.inject(plain_command("c1"));
        harness.transport.inject(rotation_command("c2", "K1"));
        harness.transport.inject(plain_command("c3"));
        harness.wait_for_acks(3).await;

        // in order, each exactly once, none skipped by the rotation
        assert_eq!(harness.transport.acknowledged(), vec!["c1", "c2", "c3"]);

        harness.shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_during_rotation_fails_without_corrupting_it() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let task = harness.spawn_run().await;

        // slow the reconnect down so the rotation window is observable
        harness
            .transport
            .set_connect_delay(Duration::from_millis(200));
        harness.transport.inject(rotation_command("m1", "K1"));
        harness.wait_for_state(ConnectionState::Rotating).await;

        let err = harness.supervisor.send(b"tick").await.unwrap_err();
        assert!(matches!(err, SendError::Rotating));

        harness.wait_for_state(ConnectionState::Connected).await;
        assert_eq!(
            harness.store.load().await.unwrap().secret_key,
            "K1".into()
        );

        harness.shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_rotation_is_fatal_and_leaves_disconnected() {
        // the remote only knows K0, so reconnecting with K9 is refused
        let harness = Harness::new(SimTransport::with_accepted_keys(["K0"])).await;
        let task = harness.spawn_run().await;

        harness.transport.inject(rotation_command("m1", "K9"));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Rotation(RotationError::Reconnect(_))
        ));
        assert_eq!(
            harness.supervisor.state().await,
            ConnectionState::Disconnected
        );

        // the new key was persisted before the reconnect attempt, so a
        // restart picks up the key already acknowledged to the remote
        assert_eq!(
            harness.store.load().await.unwrap().secret_key,
            "K9".into()
        );

        // the old handle was still closed; no leaks
        assert_eq!(harness.transport.handles_opened(), 1);
        assert_eq!(harness.transport.handles_closed(), 1);
    }

    #[tokio::test]
    async fn restart_after_interrupted_rotation_uses_the_persisted_key() {
        // simulate "persisted, then died before reconnect": the store
        // already holds K1 and the remote only accepts K1
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credential.json"));
        store
            .persist(&Credential::new("dev1", "hub.example", "K1"))
            .await
            .unwrap();

        let transport = SimTransport::with_accepted_keys(["K1"]);
        let credential = store.load().await.unwrap();
        let supervisor = ConnectionSupervisor::new(
            transport.clone(),
            store,
            credential,
            SupervisorConfig::default(),
        );

        let _commands = supervisor.start().await.unwrap();
        assert_eq!(supervisor.state().await, ConnectionState::Connected);
        assert_eq!(
            transport.events(),
            vec![Event::Connected { key: "K1".into() }]
        );
    }

    #[tokio::test]
    async fn non_rotation_commands_leave_the_connection_alone() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let task = harness.spawn_run().await;

        harness.transport.inject(plain_command("c1"));
        harness.wait_for_acks(1).await;

        assert_eq!(harness.transport.handles_opened(), 1);
        assert_eq!(harness.transport.handles_closed(), 0);
        assert_eq!(
            harness.store.load().await.unwrap().secret_key,
            "K0".into()
        );

        harness.shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let harness = Harness::new(SimTransport::accepting_any()).await;
        let _commands = harness.supervisor.start().await.unwrap();

        harness.supervisor.stop().await;
        harness.supervisor.stop().await;

        assert_eq!(
            harness.supervisor.state().await,
            ConnectionState::Disconnected
        );
        assert_eq!(harness.transport.handles_closed(), 1);
    }
}
