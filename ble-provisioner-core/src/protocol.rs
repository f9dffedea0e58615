//! Wire tokens of the provisioning protocol and parsers for the lines the
//! peripheral sends back.

use serde::{Deserialize, Serialize};

// --- Controller -> peripheral ---

/// Requests the peripheral's hardware address.
pub const GET_MAC: &str = "GET_MAC";
/// Starts a WiFi network scan on the peripheral.
pub const SCAN_WIFI: &str = "SCAN_WIFI";
/// Switches the peripheral into credential-receiving mode.
pub const CON_WIFI: &str = "CON_WIFI";
/// Prefix of the ssid payload frame.
pub const SSID_FRAME_PREFIX: &str = "S";
/// Prefix of the password payload frame.
pub const PASSWORD_FRAME_PREFIX: &str = "P";

// --- Peripheral -> controller ---

pub const MAC_PREFIX: &str = "MAC:";
pub const SCAN_BEGIN: &str = "Begin Wifi";
pub const SCAN_END: &str = "End Wifi";
pub const NETWORK_PREFIX: &str = "SSID:";
const RSSI_SEPARATOR: &str = ",RSSI:";
pub const ACK_SUCCESS: &str = "SUCCESS";
pub const ACK_FAILED: &str = "FAILED";

/// A single WiFi network reported by the peripheral during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// RSSI in dBm as reported by the peripheral.
    pub signal_strength: i32,
}

/// Builds the ssid payload frame, e.g. `Shome`.
pub fn ssid_frame(ssid: &str) -> String {
    format!("{SSID_FRAME_PREFIX}{ssid}")
}

/// Builds the password payload frame, e.g. `Psecret`.
pub fn password_frame(password: &str) -> String {
    format!("{PASSWORD_FRAME_PREFIX}{password}")
}

/// Extracts the address from a `MAC:<address>` line.
pub fn parse_mac_line(line: &str) -> Option<&str> {
    line.strip_prefix(MAC_PREFIX).map(str::trim)
}

/// Parses a `SSID:<name>,RSSI:<int>` line.
///
/// The split happens on the last `,RSSI:` so ssids containing commas survive.
/// Returns `None` for lines that are not network lines or are malformed.
pub fn parse_network_line(line: &str) -> Option<WifiNetwork> {
    let rest = line.strip_prefix(NETWORK_PREFIX)?;
    let (ssid, rssi) = rest.rsplit_once(RSSI_SEPARATOR)?;
    let signal_strength = rssi.trim().parse::<i32>().ok()?;

    Some(WifiNetwork {
        ssid: ssid.to_string(),
        signal_strength,
    })
}

/// Renders a network the way the peripheral reports it.
pub fn network_line(network: &WifiNetwork) -> String {
    format!(
        "{NETWORK_PREFIX}{}{RSSI_SEPARATOR}{}",
        network.ssid, network.signal_strength
    )
}
