//! Sample settings shared by tests across the workspace.

use crate::config::Settings;
use crate::error::ConfigError;

/// A complete, valid settings file for an `eth0` uplink and `wlan0` access
/// point on `192.168.4.0/24`.
pub const SAMPLE_ENV: &str = r#"# pigate sample settings
WAN_IFACE=eth0
LAN_IFACE=wlan0
COUNTRY_CODE=US
LAN_CIDR=192.168.4.1/24
LAN_IP=192.168.4.1
LAN_SUBNET=192.168.4.0
LAN_NETMASK=255.255.255.0
LAN_BROADCAST=192.168.4.255
DHCP_RANGE_START=192.168.4.50
DHCP_RANGE_END=192.168.4.150
DHCP_LEASE_TIME=12h
AP_SSID="pigate"
AP_PASSPHRASE='correct horse battery'
AP_CHANNEL=6
AP_HW_MODE=g
AP_WPA_KEY_MGMT=WPA-PSK
AP_WPA_PAIRWISE=TKIP
AP_RSN_PAIRWISE=CCMP
"#;

/// Parse [`SAMPLE_ENV`] with the given `KEY=VALUE` overrides appended.
pub fn sample_settings(overrides: &[(&str, &str)]) -> Result<Settings, ConfigError> {
    let mut text = SAMPLE_ENV.to_string();
    for (key, value) in overrides {
        text.push_str(&format!("{key}={value}\n"));
    }
    Settings::parse(&text)
}
