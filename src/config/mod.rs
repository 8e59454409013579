use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;

use crate::device::CoordinatorConfig;

/// Largest sensor count the emulator will pretend to have
pub const MAX_MOCK_SENSORS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("Mock sensor count must be between 1 and 16, got {0}")]
    MockSensors(usize),

    #[error("Invalid listen address {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Bridge between an FSR pad and its web UI", long_about = None)]
pub struct Cli {
    /// Serial port the pad is attached to
    #[arg(long, env = "FSR_SERIAL_PORT", default_value = "/dev/ttyACM0")]
    pub serial_port: String,

    /// Address to listen on
    #[arg(long, env = "FSR_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP and WebSocket port
    #[arg(long, env = "FSR_HTTP_PORT", default_value_t = 5000)]
    pub http_port: u16,

    /// Profile file
    #[arg(long, env = "FSR_PROFILES", default_value = "profiles.txt")]
    pub profiles: PathBuf,

    /// Directory holding the built web UI
    #[arg(long, env = "FSR_BUILD_DIR", default_value = "build")]
    pub build_dir: PathBuf,

    /// How long to wait for a device response, in milliseconds
    #[arg(long, env = "FSR_SERIAL_TIMEOUT_MS", default_value_t = 50)]
    pub serial_timeout_ms: u64,

    /// Sensor value polling period while clients are connected, in milliseconds
    #[arg(long, env = "FSR_POLL_INTERVAL_MS", default_value_t = 10)]
    pub poll_interval_ms: u64,

    /// Pause between reconnect attempts, in milliseconds
    #[arg(long, env = "FSR_RECONNECT_BACKOFF_MS", default_value_t = 1000)]
    pub reconnect_backoff_ms: u64,

    /// Talk to a built-in emulated pad instead of a serial port
    #[arg(long, env = "FSR_MOCK_SERIAL")]
    pub mock_serial: bool,

    /// Number of sensors on the emulated pad
    #[arg(long, env = "FSR_MOCK_SENSORS", default_value_t = 4)]
    pub mock_sensors: usize,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print the available serial ports and exit
    #[arg(long)]
    pub list_ports: bool,
}

/// Validated runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub serial_port: String,
    pub listen_addr: SocketAddr,
    pub profiles_path: PathBuf,
    pub build_dir: PathBuf,
    pub serial_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub mock_sensors: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            serial_port: "/dev/ttyACM0".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            profiles_path: PathBuf::from("profiles.txt"),
            build_dir: PathBuf::from("build"),
            serial_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            reconnect_backoff: Duration::from_millis(1000),
            mock_sensors: None,
        }
    }
}

impl Cli {
    pub fn into_settings(self) -> Result<Settings> {
        let serial_timeout = non_zero_millis("serial timeout", self.serial_timeout_ms)?;
        let poll_interval = non_zero_millis("poll interval", self.poll_interval_ms)?;
        let reconnect_backoff = non_zero_millis("reconnect backoff", self.reconnect_backoff_ms)?;

        let mock_sensors = if self.mock_serial {
            if !(1..=MAX_MOCK_SENSORS).contains(&self.mock_sensors) {
                return Err(ConfigError::MockSensors(self.mock_sensors));
            }
            Some(self.mock_sensors)
        } else {
            None
        };

        let ip = self
            .host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidAddress(self.host.clone()))?;
        let listen_addr = SocketAddr::new(ip, self.http_port);

        Ok(Settings {
            serial_port: self.serial_port,
            listen_addr,
            profiles_path: self.profiles,
            build_dir: self.build_dir,
            serial_timeout,
            poll_interval,
            reconnect_backoff,
            mock_sensors,
        })
    }
}

impl Settings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            profiles_path: self.profiles_path.clone(),
            poll_interval: self.poll_interval,
            reconnect_backoff: self.reconnect_backoff,
        }
    }
}

fn non_zero_millis(name: &'static str, millis: u64) -> Result<Duration> {
    if millis == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fsr-bridge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_settings_default() {
        let settings = parse(&[]).into_settings().unwrap();
        let expected = Settings::default();
        assert_eq!(settings.listen_addr, expected.listen_addr);
        assert_eq!(settings.serial_timeout, expected.serial_timeout);
        assert_eq!(settings.poll_interval, expected.poll_interval);
        assert_eq!(settings.reconnect_backoff, expected.reconnect_backoff);
        assert_eq!(settings.mock_sensors, None);
    }

    #[test]
    fn test_mock_serial_settings() {
        let settings = parse(&["--mock-serial", "--mock-sensors", "6", "--http-port", "8080"])
            .into_settings()
            .unwrap();
        assert_eq!(settings.mock_sensors, Some(6));
        assert_eq!(settings.listen_addr.port(), 8080);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            parse(&["--poll-interval-ms", "0"]).into_settings(),
            Err(ConfigError::ZeroDuration(_))
        ));
        assert!(matches!(
            parse(&["--mock-serial", "--mock-sensors", "17"]).into_settings(),
            Err(ConfigError::MockSensors(17))
        ));
        assert!(matches!(
            parse(&["--host", "not a host"]).into_settings(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
