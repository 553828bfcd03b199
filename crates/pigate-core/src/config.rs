//! Settings file loading and validation.
//!
//! The settings file is a flat list of `KEY=VALUE` lines. Values are opaque
//! strings: nothing is expanded, substituted or executed. The loaded
//! [`Settings`] record is passed explicitly to every component and never
//! changes during a run.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::error::ConfigError;

/// Keys that must be present (and non-empty) in every settings file.
pub const REQUIRED_KEYS: &[&str] = &[
    "WAN_IFACE",
    "LAN_IFACE",
    "COUNTRY_CODE",
    "LAN_CIDR",
    "LAN_IP",
    "LAN_SUBNET",
    "LAN_NETMASK",
    "LAN_BROADCAST",
    "DHCP_RANGE_START",
    "DHCP_RANGE_END",
    "DHCP_LEASE_TIME",
    "AP_SSID",
    "AP_PASSPHRASE",
    "AP_CHANNEL",
    "AP_HW_MODE",
    "AP_WPA_KEY_MGMT",
    "AP_WPA_PAIRWISE",
    "AP_RSN_PAIRWISE",
];

/// Optional keys and the values used when they are absent.
pub const DEFAULTS: &[(&str, &str)] = &[
    ("DNS_PRIMARY", "1.1.1.1"),
    ("DNS_SECONDARY", "8.8.8.8"),
    ("WAN_CHECK_HOST", "1.1.1.1"),
    ("DHCP_LEASE_FILE", "/var/lib/misc/dnsmasq.leases"),
];

/// Keys whose values must never be printed or written world-readable.
pub const SECRET_KEYS: &[&str] = &["AP_PASSPHRASE"];

const REDACTED: &str = "********";

// ---------------------------------------------------------------------------
// Ipv4Cidr
// ---------------------------------------------------------------------------

/// An IPv4 address with its prefix length, e.g. `192.168.4.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Ipv4Addr::from(bits)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask()))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("expected a.b.c.d/n, got {s:?}"))?;
        let address = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| format!("{addr:?} is not an IPv4 address"))?;
        let prefix = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| format!("prefix {prefix:?} is not in 0..=32"))?;
        Ok(Self { address, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Validated settings for one invocation.
///
/// `values` holds every key from the file plus defaults, and is what
/// templates are rendered against. The typed fields are the subset the
/// engine itself reasons about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
    pub wan_iface: String,
    pub lan_iface: String,
    pub country_code: String,
    pub lan_cidr: Ipv4Cidr,
    pub dhcp_range_start: Ipv4Addr,
    pub dhcp_range_end: Ipv4Addr,
    pub ap_ssid: String,
    pub ap_channel: u16,
    pub wan_check_host: String,
    pub lease_file: PathBuf,
}

impl Settings {
    /// Parse and validate settings file contents.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::from_map(parse_env(text)?)
    }

    /// Validate a raw key/value map.
    ///
    /// Every missing required key is reported at once, in declaration
    /// order, before any value is inspected.
    pub fn from_map(mut values: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|key| values.get(**key).map_or(true, |v| v.is_empty()))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }

        for (key, default) in DEFAULTS {
            let entry = values.entry(key.to_string()).or_default();
            if entry.is_empty() {
                *entry = default.to_string();
            }
        }

        let get = |key: &str| values.get(key).cloned().unwrap_or_default();

        let wan_iface = interface_name("WAN_IFACE", &get("WAN_IFACE"))?;
        let lan_iface = interface_name("LAN_IFACE", &get("LAN_IFACE"))?;

        let country_code = get("COUNTRY_CODE");
        if country_code.len() != 2 || !country_code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(invalid("COUNTRY_CODE", "expected two uppercase letters"));
        }

        let lan_cidr: Ipv4Cidr = get("LAN_CIDR")
            .parse()
            .map_err(|reason: String| invalid("LAN_CIDR", &reason))?;
        let lan_ip = ipv4("LAN_IP", &get("LAN_IP"))?;
        if lan_ip != lan_cidr.address {
            return Err(invalid(
                "LAN_IP",
                &format!("{lan_ip} does not match LAN_CIDR address {}", lan_cidr.address),
            ));
        }
        for key in ["LAN_SUBNET", "LAN_NETMASK", "LAN_BROADCAST"] {
            ipv4(key, &get(key))?;
        }

        let dhcp_range_start = ipv4("DHCP_RANGE_START", &get("DHCP_RANGE_START"))?;
        let dhcp_range_end = ipv4("DHCP_RANGE_END", &get("DHCP_RANGE_END"))?;
        if u32::from(dhcp_range_start) > u32::from(dhcp_range_end) {
            return Err(invalid(
                "DHCP_RANGE_START",
                &format!("{dhcp_range_start} is after DHCP_RANGE_END {dhcp_range_end}"),
            ));
        }

        let ap_ssid = get("AP_SSID");
        if ap_ssid.len() > 32 {
            return Err(invalid("AP_SSID", "must be at most 32 bytes"));
        }

        let passphrase_len = get("AP_PASSPHRASE").chars().count();
        if !(8..=63).contains(&passphrase_len) {
            return Err(invalid("AP_PASSPHRASE", "must be 8 to 63 characters"));
        }

        let ap_channel = get("AP_CHANNEL")
            .parse::<u16>()
            .ok()
            .filter(|c| (1..=196).contains(c))
            .ok_or_else(|| invalid("AP_CHANNEL", "expected an integer in 1..=196"))?;

        if !matches!(get("AP_HW_MODE").as_str(), "a" | "b" | "g") {
            return Err(invalid("AP_HW_MODE", "expected one of a, b, g"));
        }

        for key in ["DNS_PRIMARY", "DNS_SECONDARY"] {
            ipv4(key, &get(key))?;
        }

        let wan_check_host = get("WAN_CHECK_HOST");
        let lease_file = PathBuf::from(get("DHCP_LEASE_FILE"));
        if !lease_file.is_absolute() {
            return Err(invalid("DHCP_LEASE_FILE", "must be an absolute path"));
        }

        Ok(Self {
            values,
            wan_iface,
            lan_iface,
            country_code,
            lan_cidr,
            dhcp_range_start,
            dhcp_range_end,
            ap_ssid,
            ap_channel,
            wan_check_host,
            lease_file,
        })
    }

    /// Look up a raw value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// All resolved values, defaults included.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Resolved values with secrets masked, for display.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(key, value)| {
                if SECRET_KEYS.contains(&key.as_str()) {
                    (key.clone(), REDACTED.to_string())
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }
}

/// Read and validate a settings file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let settings = Settings::parse(&text)?;
    tracing::debug!(path = %path.display(), keys = settings.values.len(), "Settings loaded");
    Ok(settings)
}

/// Split settings file contents into a key/value map.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is dropped,
/// one matching pair of surrounding quotes is removed from the value and a
/// later assignment overrides an earlier one.
pub fn parse_env(text: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut values = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = || ConfigError::Malformed {
            line: idx + 1,
            content: raw.to_string(),
        };

        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        let key = key.trim();
        let key = key.strip_prefix("export ").map(str::trim).unwrap_or(key);
        if !is_valid_key(key) {
            return Err(malformed());
        }

        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(values)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn ipv4(key: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(key, &format!("{value:?} is not an IPv4 address")))
}

fn interface_name(key: &str, value: &str) -> Result<String, ConfigError> {
    if value.len() > 15 || value.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(invalid(
            key,
            "interface names are at most 15 characters without whitespace or '/'",
        ));
    }
    Ok(value.to_string())
}
