//! Collaborator trait definitions for pigate
//!
//! These traits describe everything the provisioning engine asks of the host:
//! - `PackageManager`: package presence and installation
//! - `ServiceManager`: unit lifecycle and journal access
//! - `NetworkProbe`: links, addresses, routes, sockets, sysctls, radio state
//! - `Firewall`: NAT rule inspection, rule loading and persistence
//! - `DaemonTools`: daemon-specific configuration self-tests
//!
//! All traits are async and backend-agnostic. The process-backed
//! implementation lives in `system`; an in-memory fake for tests lives in
//! `fakes`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Result type for host operations
pub type HostResult<T> = std::result::Result<T, HostError>;

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// Transport protocol of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// A socket in listening (or unconnected, for UDP) state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    /// Owning process name, when the kernel reported it.
    pub process: Option<String>,
}

impl Listener {
    /// Whether this socket is held by the named process.
    pub fn is_held_by(&self, process: &str) -> bool {
        self.process.as_deref() == Some(process)
    }
}

/// Link state of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// The interface does not exist.
    Missing,
    /// The interface exists but is administratively down or has no carrier.
    Down,
    /// The interface is up with carrier.
    Up,
}

impl LinkState {
    pub fn exists(&self) -> bool {
        !matches!(self, LinkState::Missing)
    }

    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Missing => f.write_str("missing"),
            LinkState::Down => f.write_str("down"),
            LinkState::Up => f.write_str("up"),
        }
    }
}

// ---------------------------------------------------------------------------
// PackageManager
// ---------------------------------------------------------------------------

/// Distribution package manager.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Whether a usable package manager exists on this host.
    async fn is_available(&self) -> bool;

    /// Whether `package` is currently installed.
    async fn is_installed(&self, package: &str) -> HostResult<bool>;

    /// Install the given packages non-interactively.
    async fn install(&self, packages: &[String]) -> HostResult<()>;
}

// ---------------------------------------------------------------------------
// ServiceManager
// ---------------------------------------------------------------------------

/// Init system / service supervisor.
///
/// Unit names are passed without the `.service` suffix.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn is_active(&self, unit: &str) -> HostResult<bool>;

    async fn is_enabled(&self, unit: &str) -> HostResult<bool>;

    async fn start(&self, unit: &str) -> HostResult<()>;

    async fn stop(&self, unit: &str) -> HostResult<()>;

    async fn restart(&self, unit: &str) -> HostResult<()>;

    async fn enable(&self, unit: &str) -> HostResult<()>;

    /// Remove a mask so the unit can be started at all.
    async fn unmask(&self, unit: &str) -> HostResult<()>;

    /// The last `lines` lines the unit wrote to its log.
    async fn journal_tail(&self, unit: &str, lines: usize) -> HostResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// NetworkProbe
// ---------------------------------------------------------------------------

/// Kernel networking state and the user-space tools that change it.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn link_state(&self, iface: &str) -> HostResult<LinkState>;

    /// IPv4 addresses on `iface` in CIDR form (`10.0.0.1/24`).
    async fn ipv4_addresses(&self, iface: &str) -> HostResult<Vec<String>>;

    async fn set_link_up(&self, iface: &str) -> HostResult<()>;

    /// Assign `cidr` to `iface`, replacing an identical existing address.
    async fn replace_address(&self, iface: &str, cidr: &str) -> HostResult<()>;

    /// Interface carrying the IPv4 default route, if any.
    async fn default_route_interface(&self) -> HostResult<Option<String>>;

    /// Whether `host` answers a single echo request.
    async fn is_reachable(&self, host: &str) -> HostResult<bool>;

    async fn listeners(&self, protocol: Protocol) -> HostResult<Vec<Listener>>;

    async fn sysctl(&self, key: &str) -> HostResult<String>;

    async fn set_sysctl(&self, key: &str, value: &str) -> HostResult<()>;

    /// Clear any soft radio block on Wi-Fi devices.
    async fn unblock_wifi(&self) -> HostResult<()>;

    async fn set_regulatory_domain(&self, country: &str) -> HostResult<()>;
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

/// Packet filter front-end.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Whether a MASQUERADE rule for traffic leaving `wan_iface` is loaded.
    async fn has_masquerade(&self, wan_iface: &str) -> HostResult<bool>;

    /// Atomically replace the loaded ruleset with the file at `rules_path`.
    async fn load_rules(&self, rules_path: &Path) -> HostResult<()>;

    /// Save the loaded ruleset so it is restored on boot.
    async fn persist_rules(&self) -> HostResult<()>;
}

// ---------------------------------------------------------------------------
// DaemonTools
// ---------------------------------------------------------------------------

/// Configuration self-tests offered by the managed daemons.
#[async_trait]
pub trait DaemonTools: Send + Sync {
    /// Run the DNS/DHCP daemon's syntax check against `config_path`.
    async fn check_dnsmasq_config(&self, config_path: &Path) -> HostResult<()>;
}

/// Everything the engine needs from a host, as one object.
pub trait Host: PackageManager + ServiceManager + NetworkProbe + Firewall + DaemonTools {}

impl<T> Host for T where T: PackageManager + ServiceManager + NetworkProbe + Firewall + DaemonTools {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn link_state_predicates() {
        assert!(!LinkState::Missing.exists());
        assert!(LinkState::Down.exists());
        assert!(!LinkState::Down.is_up());
        assert!(LinkState::Up.is_up());
    }

    #[test]
    fn listener_ownership() {
        let l = Listener {
            protocol: Protocol::Udp,
            address: "127.0.0.53%lo".to_string(),
            port: 53,
            process: Some("systemd-resolve".to_string()),
        };
        assert!(l.is_held_by("systemd-resolve"));
        assert!(!l.is_held_by("dnsmasq"));
    }
}
