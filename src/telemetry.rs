use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, instrument, trace, warn};

use crate::supervisor::ConnectionSupervisor;
use crate::transport::Transport;

const TEMPERATURE_ALERT_THRESHOLD: i32 = 30;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TelemetryReading {
    pub temperature: i32,
    pub humidity: i32,
    pub temperature_alert: bool,
}

/// Generates telemetry readings from an injected random source.
///
/// Seeding makes a run reproducible; without a seed the generator
/// draws from OS entropy.
pub struct TelemetryGenerator {
    rng: StdRng,
}

impl TelemetryGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    pub fn next_reading(&mut self) -> TelemetryReading {
        let temperature = self.rng.random_range(20..35);
        let humidity = self.rng.random_range(60..80);
        TelemetryReading {
            temperature,
            humidity,
            temperature_alert: temperature > TEMPERATURE_ALERT_THRESHOLD,
        }
    }
}

/// Send one telemetry reading per tick until shutdown.
///
/// Telemetry is best-effort: a failed send is logged and dropped, the
/// loop carries on. In particular sends fail fast during a credential
/// rotation and resume once the new connection is up.
#[instrument(name = "telemetry", skip_all)]
pub async fn start_telemetry<T: Transport>(
    supervisor: &ConnectionSupervisor<T>,
    interval: Duration,
    mut generator: TelemetryGenerator,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut count: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reading = generator.next_reading();
                let payload = serde_json::to_vec(&reading)
                    .expect("telemetry reading serialization failed");

                count += 1;
                match supervisor.send(&payload).await {
                    Ok(()) => info!("sent telemetry message {count}"),
                    Err(err) => warn!("dropping telemetry message {count}: {err}"),
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    trace!("telemetry loop stopped");
}
