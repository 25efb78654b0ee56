//! Link configuration.
//!
//! Static matching criteria for each device family plus the timing
//! parameters used by the supervisor. Configurations can be built from the
//! family presets or loaded from TOML:
//!
//! ```toml
//! scan_timeout_ms = 10000
//! connect_timeout_ms = 10000
//!
//! [target]
//! exact_name = "Alchemy_TP"
//!
//! [target.gatt]
//! service = "FFE0"
//! characteristic = "FFE1"
//! descriptor = "2902"
//!
//! [retry]
//! initial_delay_ms = 2000
//! max_delay_ms = 30000
//! max_attempts = 10
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::ble::uuids::{parse_short, CCCD_SHORT, SENSOR_CHARACTERISTIC_SHORT, SENSOR_SERVICE_SHORT};
use crate::error::{Error, Result};

/// Advertised name of the GATT sensor family.
pub const GATT_SENSOR_NAME: &str = "Alchemy_TP";

/// Bonded name of the EEG headset family.
pub const EEG_HEADSET_NAME: &str = "Alchemy";

/// Default scan duration before giving up on discovery.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Short UUIDs addressing the notifying characteristic (family a only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTarget {
    /// Service short UUID.
    pub service: u16,
    /// Characteristic short UUID.
    pub characteristic: u16,
    /// Notification-enable descriptor short UUID.
    pub descriptor: u16,
}

impl Default for GattTarget {
    fn default() -> Self {
        Self {
            service: SENSOR_SERVICE_SHORT,
            characteristic: SENSOR_CHARACTERISTIC_SHORT,
            descriptor: CCCD_SHORT,
        }
    }
}

/// Matching criteria for the target peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// Name the peripheral must carry exactly.
    pub exact_name: String,
    /// Fallback substring, only consulted when listing bonded devices.
    pub name_substring: Option<String>,
    /// GATT addressing. `None` means the transport resolves services itself.
    pub gatt: Option<GattTarget>,
}

impl TargetSpec {
    /// Target for the GATT sensor family.
    pub fn gatt_sensor() -> Self {
        Self {
            exact_name: GATT_SENSOR_NAME.to_string(),
            name_substring: None,
            gatt: Some(GattTarget::default()),
        }
    }

    /// Target for the vendor-SDK EEG headset family.
    pub fn eeg_headset() -> Self {
        Self {
            exact_name: EEG_HEADSET_NAME.to_string(),
            name_substring: Some(EEG_HEADSET_NAME.to_string()),
            gatt: None,
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Number of retries scheduled before giving up.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30000),
            max_attempts: 10,
        }
    }
}

/// Complete configuration for one supervised link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// What to look for.
    pub target: TargetSpec,
    /// How long a discovery scan may run.
    pub scan_timeout: Duration,
    /// How long a connection attempt may take.
    pub connect_timeout: Duration,
    /// Retry policy.
    pub retry: RetryConfig,
}

impl LinkConfig {
    /// Configuration with default timings for the given target.
    pub fn new(target: TargetSpec) -> Self {
        Self {
            target,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    /// Preset for the GATT sensor family.
    pub fn gatt_sensor() -> Self {
        Self::new(TargetSpec::gatt_sensor())
    }

    /// Preset for the vendor-SDK EEG headset family.
    pub fn eeg_headset() -> Self {
        Self::new(TargetSpec::eeg_headset())
    }

    /// Parse and validate a TOML configuration.
    ///
    /// Missing fields fall back to the GATT sensor preset.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawLinkConfig = toml::from_str(text)?;
        let config = raw.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the supervisor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.target.exact_name.is_empty() {
            return Err(invalid("target.exact_name", ""));
        }
        if self.scan_timeout.is_zero() {
            return Err(invalid("scan_timeout", "0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "0"));
        }
        if self.retry.initial_delay.is_zero() {
            return Err(invalid("retry.initial_delay", "0"));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(invalid(
                "retry.max_delay",
                &format!("{:?}", self.retry.max_delay),
            ));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::gatt_sensor()
    }
}

fn invalid(name: &str, value: &str) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLinkConfig {
    scan_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    target: Option<RawTarget>,
    retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    exact_name: String,
    #[serde(default)]
    name_substring: Option<String>,
    #[serde(default)]
    gatt: Option<RawGatt>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGatt {
    service: String,
    characteristic: String,
    #[serde(default)]
    descriptor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawRetry {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

impl RawLinkConfig {
    fn into_config(self) -> Result<LinkConfig> {
        let mut config = LinkConfig::gatt_sensor();

        if let Some(target) = self.target {
            let gatt = match target.gatt {
                Some(gatt) => Some(GattTarget {
                    service: parse_short(&gatt.service)?,
                    characteristic: parse_short(&gatt.characteristic)?,
                    descriptor: match gatt.descriptor {
                        Some(d) => parse_short(&d)?,
                        None => CCCD_SHORT,
                    },
                }),
                None => None,
            };
            config.target = TargetSpec {
                exact_name: target.exact_name,
                name_substring: target.name_substring,
                gatt,
            };
        }

        if let Some(ms) = self.scan_timeout_ms {
            config.scan_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(retry) = self.retry {
            if let Some(ms) = retry.initial_delay_ms {
                config.retry.initial_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = retry.max_delay_ms {
                config.retry.max_delay = Duration::from_millis(ms);
            }
            if let Some(n) = retry.max_attempts {
                config.retry.max_attempts = n;
            }
        }

        Ok(config)
    }
}
