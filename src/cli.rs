use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{DeviceId, SecretKey};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Directory holding the persisted device credential
    #[arg(env = "REKEYD_CONFIG_DIR", long = "config-dir", value_name = "dir")]
    pub config_dir: Option<PathBuf>,

    /// Unique identifier for this device, used on first run
    #[arg(env = "REKEYD_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: Option<DeviceId>,

    /// Host endpoint of the remote service, used on first run
    #[arg(
        env = "REKEYD_HOST_ENDPOINT",
        long = "host-endpoint",
        value_name = "host"
    )]
    pub host_endpoint: Option<String>,

    /// Secret key for authentication, used on first run
    #[arg(
        env = "REKEYD_DEVICE_KEY",
        long = "device-key",
        value_name = "key",
        requires = "device_id",
        requires = "host_endpoint"
    )]
    pub device_key: Option<SecretKey>,

    /// Telemetry interval in milliseconds
    #[arg(
        env = "REKEYD_TELEMETRY_INTERVAL_MS",
        long = "telemetry-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "10000"
    )]
    pub telemetry_interval: Duration,

    /// Seed for the telemetry generator, for reproducible runs
    #[arg(
        env = "REKEYD_TELEMETRY_SEED",
        long = "telemetry-seed",
        value_name = "u64"
    )]
    pub telemetry_seed: Option<u64>,

    /// Connect timeout in milliseconds
    #[arg(
        env = "REKEYD_CONNECT_TIMEOUT_MS",
        long = "connect-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "10000"
    )]
    pub connect_timeout: Duration,

    /// Send timeout in milliseconds
    #[arg(
        env = "REKEYD_SEND_TIMEOUT_MS",
        long = "send-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    pub send_timeout: Duration,

    /// Inject a simulated rotation command carrying this key
    #[arg(
        env = "REKEYD_DEMO_ROTATE_KEY",
        long = "demo-rotate-key",
        value_name = "key"
    )]
    pub demo_rotate_key: Option<SecretKey>,

    /// Delay before the simulated rotation command, in milliseconds
    #[arg(
        env = "REKEYD_DEMO_ROTATE_AFTER_MS",
        long = "demo-rotate-after-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "15000",
        requires = "demo_rotate_key"
    )]
    pub demo_rotate_after: Duration,
}

impl Cli {
    /// Where the device credential lives on disk
    pub fn credential_path(&self) -> PathBuf {
        let dir = self
            .config_dir
            .clone()
            .unwrap_or_else(default_config_dir);
        dir.join("credential").with_extension("json")
    }
}

fn default_config_dir() -> PathBuf {
    let dir = if let Some(config_dir) = dirs::config_dir() {
        config_dir
    } else {
        // Fallback to home directory if config dir is not available
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    };
    dir.join(env!("CARGO_PKG_NAME"))
}

pub fn parse() -> Cli {
    Cli::parse()
}
