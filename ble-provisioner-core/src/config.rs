use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// GATT service exposed by the provisioning firmware.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ab);
/// Characteristic used both for writes and for notifications.
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xabcdefab_1234_5678_9abc_def012345678);

const DEFAULT_ADDRESS_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SCAN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONFIGURE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SETTLE_MS: u64 = 200;
const DEFAULT_POST_CONNECT_MS: u64 = 500;
const DEFAULT_SELECTION_WINDOW_MS: u64 = 5_000;

/// Top-level application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub selection: SelectionConfig,
}

/// Everything the provisioning session needs at runtime.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,

    // === Operation deadlines ===
    pub address_timeout: Duration,
    pub scan_timeout: Duration,
    pub configure_timeout: Duration,

    /// Pause between consecutive writes of one exchange; the firmware needs it
    /// to switch its internal mode.
    pub settle_interval: Duration,
    /// Pause a caller should leave between connecting and the first request.
    pub post_connect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            address_timeout: Duration::from_millis(DEFAULT_ADDRESS_TIMEOUT_MS),
            scan_timeout: Duration::from_millis(DEFAULT_SCAN_TIMEOUT_MS),
            configure_timeout: Duration::from_millis(DEFAULT_CONFIGURE_TIMEOUT_MS),
            settle_interval: Duration::from_millis(DEFAULT_SETTLE_MS),
            post_connect_delay: Duration::from_millis(DEFAULT_POST_CONNECT_MS),
        }
    }
}

/// How a transport picks the peripheral when asked to scan for one.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// How long to listen for advertisements before choosing.
    pub window: Duration,
    /// Only accept peripherals whose local name contains this text.
    pub name_filter: Option<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_SELECTION_WINDOW_MS),
            name_filter: None,
        }
    }
}

// ============= TOML file layout =============

#[derive(Deserialize)]
struct AppConfigFile {
    /// [ble] table
    ble: BleConfigToml,

    /// [timeouts] table (optional)
    #[serde(default)]
    timeouts: TimeoutsToml,
}

#[derive(Deserialize)]
struct BleConfigToml {
    service_uuid: String,
    characteristic_uuid: String,
    #[serde(default = "default_selection_window_ms")]
    selection_window_ms: u64,
    #[serde(default)]
    name_filter: Option<String>,
}

#[derive(Deserialize)]
#[serde(default)]
struct TimeoutsToml {
    address_ms: u64,
    scan_ms: u64,
    configure_ms: u64,
    settle_ms: u64,
    post_connect_ms: u64,
}

impl Default for TimeoutsToml {
    fn default() -> Self {
        Self {
            address_ms: DEFAULT_ADDRESS_TIMEOUT_MS,
            scan_ms: DEFAULT_SCAN_TIMEOUT_MS,
            configure_ms: DEFAULT_CONFIGURE_TIMEOUT_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            post_connect_ms: DEFAULT_POST_CONNECT_MS,
        }
    }
}

fn default_selection_window_ms() -> u64 {
    DEFAULT_SELECTION_WINDOW_MS
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|e| Error::Config(format!("{field} '{value}': {e}")))
}

impl TryFrom<AppConfigFile> for AppConfig {
    type Error = Error;

    fn try_from(t: AppConfigFile) -> Result<Self> {
        let name_filter = t.ble.name_filter.filter(|name| !name.trim().is_empty());

        Ok(AppConfig {
            session: SessionConfig {
                service_uuid: parse_uuid("service_uuid", &t.ble.service_uuid)?,
                characteristic_uuid: parse_uuid("characteristic_uuid", &t.ble.characteristic_uuid)?,
                address_timeout: Duration::from_millis(t.timeouts.address_ms),
                scan_timeout: Duration::from_millis(t.timeouts.scan_ms),
                configure_timeout: Duration::from_millis(t.timeouts.configure_ms),
                settle_interval: Duration::from_millis(t.timeouts.settle_ms),
                post_connect_delay: Duration::from_millis(t.timeouts.post_connect_ms),
            },
            selection: SelectionConfig {
                window: Duration::from_millis(t.ble.selection_window_ms),
                name_filter,
            },
        })
    }
}

// ============= Loading =============

/// Loads the application configuration from a TOML string.
pub fn load_config_from_toml_str(s: &str) -> Result<AppConfig> {
    let parsed: AppConfigFile = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
    AppConfig::try_from(parsed)
}

/// Loads the application configuration from a TOML file on disk.
pub fn load_config_from_path(path: impl AsRef<std::path::Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_file_overrides_every_default() {
        let config = load_config_from_toml_str(
            r#"
            [ble]
            service_uuid = "0000ffe0-0000-1000-8000-00805f9b34fb"
            characteristic_uuid = "0000ffe1-0000-1000-8000-00805f9b34fb"
            selection_window_ms = 2500
            name_filter = "MedBox"

            [timeouts]
            address_ms = 1000
            scan_ms = 2000
            configure_ms = 3000
            settle_ms = 250
            post_connect_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(
            config.session.service_uuid,
            Uuid::parse_str("0000ffe0-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(config.session.address_timeout, Duration::from_secs(1));
        assert_eq!(config.session.scan_timeout, Duration::from_secs(2));
        assert_eq!(config.session.configure_timeout, Duration::from_secs(3));
        assert_eq!(config.session.settle_interval, Duration::from_millis(250));
        assert_eq!(config.session.post_connect_delay, Duration::ZERO);
        assert_eq!(config.selection.window, Duration::from_millis(2500));
        assert_eq!(config.selection.name_filter.as_deref(), Some("MedBox"));
    }

    #[test]
    fn missing_timeouts_fall_back_to_defaults() {
        let config = load_config_from_toml_str(
            r#"
            [ble]
            service_uuid = "12345678-1234-1234-1234-1234567890ab"
            characteristic_uuid = "abcdefab-1234-5678-9abc-def012345678"
            name_filter = ""

            [timeouts]
            scan_ms = 15000
            "#,
        )
        .unwrap();

        let defaults = SessionConfig::default();
        assert_eq!(config.session.service_uuid, defaults.service_uuid);
        assert_eq!(config.session.characteristic_uuid, defaults.characteristic_uuid);
        assert_eq!(config.session.scan_timeout, Duration::from_secs(15));
        assert_eq!(config.session.address_timeout, defaults.address_timeout);
        assert_eq!(config.session.settle_interval, Duration::from_millis(200));
        assert_eq!(config.selection.name_filter, None);
    }

    #[test]
    fn invalid_uuid_is_a_config_error() {
        let err = load_config_from_toml_str(
            r#"
            [ble]
            service_uuid = "not-a-uuid"
            characteristic_uuid = "abcdefab-1234-5678-9abc-def012345678"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(msg) if msg.contains("service_uuid")));
    }

    #[test]
    fn missing_ble_table_is_a_config_error() {
        assert!(matches!(
            load_config_from_toml_str("[timeouts]\nscan_ms = 1\n"),
            Err(Error::Config(_))
        ));
    }
}
