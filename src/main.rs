use std::error::Error;

use tokio::signal;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use rekeyd::cli::{self, Cli};
use rekeyd::credential::{Credential, CredentialStore, CredentialStoreError};
use rekeyd::supervisor::{ConnectionSupervisor, ROTATION_KEY_ATTRIBUTE, SupervisorConfig};
use rekeyd::telemetry::{TelemetryGenerator, start_telemetry};
use rekeyd::transport::InboundCommand;
use rekeyd::transport::sim::SimTransport;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default().add_directive("debug".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[derive(Debug, thiserror::Error)]
#[error(
    "no stored credential found; pass --device-id, --host-endpoint and --device-key for the first run"
)]
struct MissingIdentity;

/// Resolve the credential to connect with.
///
/// A previously stored credential always wins: it may hold a rotated
/// key the remote already expects, so CLI identity arguments that
/// disagree with it are warned about and ignored. On a true first run
/// the CLI identity seeds the store.
async fn resolve_credential(
    cli: &Cli,
    store: &CredentialStore,
) -> Result<Credential, Box<dyn Error>> {
    let stored = store.load().await?;

    if stored.is_initialized() {
        if cli.device_id.is_some() && cli.device_id.as_ref() != Some(&stored.device_id) {
            warn!("ignoring --device-id argument that is different to the stored credential");
        }
        if cli.host_endpoint.is_some() && cli.host_endpoint.as_ref() != Some(&stored.host_endpoint)
        {
            warn!("ignoring --host-endpoint argument that is different to the stored credential");
        }
        if cli.device_key.is_some() && cli.device_key.as_ref() != Some(&stored.secret_key) {
            warn!("ignoring --device-key argument that is different to the stored credential");
        }
        return Ok(stored);
    }

    if let (Some(device_id), Some(host_endpoint), Some(secret_key)) =
        (&cli.device_id, &cli.host_endpoint, &cli.device_key)
    {
        let credential = Credential::new(
            device_id.clone(),
            host_endpoint.clone(),
            secret_key.clone(),
        );
        store.persist(&credential).await?;
        info!("stored first-run identity for device {device_id}");
        return Ok(credential);
    }

    Err(MissingIdentity.into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();

    let store = CredentialStore::new(cli.credential_path());
    let credential = resolve_credential(&cli, &store).await?;
    debug!("using credential path {}", store.path().display());

    // The transport stands in for the real connection stack; it accepts
    // whatever key the device presents and echoes operator commands
    let transport = SimTransport::accepting_any();

    let supervisor = ConnectionSupervisor::new(
        transport.clone(),
        store,
        credential,
        SupervisorConfig {
            connect_timeout: cli.connect_timeout,
            send_timeout: cli.send_timeout,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; will exit");
            let _ = shutdown_tx.send(true);
        }
    });
    info!("press Ctrl+C at any time to quit");

    // Optionally play the operator: deliver one rotation command after
    // a delay, the way a cloud console would
    if let Some(new_key) = cli.demo_rotate_key.clone() {
        let transport = transport.clone();
        let delay = cli.demo_rotate_after;
        tokio::spawn(async move {
            time::sleep(delay).await;
            info!("injecting simulated rotation command");
            transport.inject(InboundCommand {
                id: "demo-rotation-1".to_owned(),
                attributes: [(ROTATION_KEY_ATTRIBUTE.to_owned(), new_key.to_string())].into(),
                payload: b"rotate".to_vec(),
            });
        });
    }

    let commands = supervisor.start().await?;
    info!("waiting for commands from the remote service");

    let generator = TelemetryGenerator::new(cli.telemetry_seed);
    let result = tokio::select! {
        res = supervisor.run(commands, shutdown_rx.clone()) => res,
        _ = start_telemetry(
            &supervisor,
            cli.telemetry_interval,
            generator,
            shutdown_rx.clone(),
        ) => Ok(()),
    };

    // close the active handle whether we're exiting cleanly or not
    supervisor.stop().await;
    result?;

    info!("done");
    Ok(())
}
