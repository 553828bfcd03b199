//! Destination layout for rendered configuration.
//!
//! Every path is resolved against a filesystem root so a whole run can be
//! pointed at a scratch directory instead of `/`.

use std::path::{Component, Path, PathBuf};

pub const HOSTAPD_CONF: &str = "/etc/hostapd/hostapd.conf";
pub const HOSTAPD_DEFAULT: &str = "/etc/default/hostapd";
pub const DNSMASQ_CONF: &str = "/etc/dnsmasq.d/pigate.conf";
pub const DHCPCD_CONF: &str = "/etc/dhcpcd.conf";
pub const SYSCTL_FORWARDING: &str = "/etc/sysctl.d/90-pigate-forwarding.conf";
pub const RULES_V4: &str = "/etc/iptables/rules.v4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    root: PathBuf,
}

impl Default for TargetPaths {
    fn default() -> Self {
        Self::new("/")
    }
}

impl TargetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join an absolute host path onto the root.
    pub fn resolve(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let mut out = self.root.clone();
        for component in absolute.as_ref().components() {
            if let Component::Normal(part) = component {
                out.push(part);
            }
        }
        out
    }

    pub fn hostapd_conf(&self) -> PathBuf {
        self.resolve(HOSTAPD_CONF)
    }

    pub fn hostapd_default(&self) -> PathBuf {
        self.resolve(HOSTAPD_DEFAULT)
    }

    pub fn dnsmasq_conf(&self) -> PathBuf {
        self.resolve(DNSMASQ_CONF)
    }

    pub fn dhcpcd_conf(&self) -> PathBuf {
        self.resolve(DHCPCD_CONF)
    }

    pub fn sysctl_forwarding(&self) -> PathBuf {
        self.resolve(SYSCTL_FORWARDING)
    }

    pub fn rules_v4(&self) -> PathBuf {
        self.resolve(RULES_V4)
    }
}
