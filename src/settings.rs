use std::{path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::ups::WaitPolicy;

// The following define the serial link to the UPS.
const DEVICE: &str = "/dev/ttyAMA2";
const BAUD_RATE: u32 = 9600;
const CHUNK_SIZE: usize = 100; // Bytes requested per read, enough for one whole frame.
const READ_TIMEOUT_MS: u64 = 500; // Per-read timeout on the port.
const WAIT_POLL_MS: u64 = 5; // Window between discarding stale input and checking again.
const STARTUP_TIMEOUT: u64 = 3; // Seconds to wait for the UPS to say anything at start.

// The following define polling and output behaviour.
const POLL_DELAY: u64 = 10; // Seconds to wait between polls.
const MAX_CONSECUTIVE_FAILURES: u32 = 5; // Bad cycles in a row before giving up.
const STATUS_FILE: &str = "UPSstat.info";
const HEALTH_FILE: &str = "UPSstat.health";
const LOW_OUTPUT_MV: u32 = 5200; // Output below this means the pack can no longer hold the rail.

const ENV_PREFIX: &str = "UPSINFO_";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Settings {
    pub device: String,
    pub baud_rate: u32,
    pub chunk_size: usize,
    pub read_timeout_ms: u64,
    pub wait_timeout: Option<u64>,
    pub wait_poll_ms: u64,
    pub startup_timeout: u64,
    pub poll_delay: u64,
    pub max_consecutive_failures: u32,
    pub status_file: PathBuf,
    pub health: bool,
    pub health_file: PathBuf,
    pub console: bool,
    pub low_output_mv: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            device: DEVICE.to_string(),
            baud_rate: BAUD_RATE,
            chunk_size: CHUNK_SIZE,
            read_timeout_ms: READ_TIMEOUT_MS,
            wait_timeout: None,
            wait_poll_ms: WAIT_POLL_MS,
            startup_timeout: STARTUP_TIMEOUT,
            poll_delay: POLL_DELAY,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            status_file: PathBuf::from(STATUS_FILE),
            health: true,
            health_file: PathBuf::from(HEALTH_FILE),
            console: true,
            low_output_mv: LOW_OUTPUT_MV,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file (if present), then `UPSINFO_*` variables.
    pub fn figment(config: &std::path::Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(config: &std::path::Path) -> Result<Settings, figment::Error> {
        Settings::figment(config).extract()
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        let mut wait = WaitPolicy::unbounded(Duration::from_millis(self.wait_poll_ms));
        wait.timeout = self.wait_timeout.map(Duration::from_secs);
        wait
    }

    /// Where health lines go, unless `health = false` turned them off.
    pub fn health_file(&self) -> Option<&std::path::Path> {
        if self.health {
            Some(&self.health_file)
        } else {
            None
        }
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.poll_delay)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }
}
