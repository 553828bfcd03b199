//! Process-backed host: drives the real collaborator tools.
//!
//! `apt-get`/`dpkg-query` for packages, `systemctl`/`journalctl` for units,
//! `ip`/`ss`/`sysctl`/`rfkill`/`iw`/`ping` for networking,
//! `iptables`/`iptables-restore`/`netfilter-persistent` for the firewall and
//! `dnsmasq --test` for config self-checks.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::command::{run, run_checked, run_with_env};
use crate::error::HostError;
use crate::parse;
use crate::traits::*;

/// Host implementation that shells out to the system tools.
#[derive(Debug, Clone)]
pub struct SystemHost {
    /// Seconds `ping` waits for a reply.
    pub ping_timeout_secs: u32,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 2,
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PackageManager for SystemHost {
    async fn is_available(&self) -> bool {
        matches!(run("apt-get", &["--version"]).await, Ok(out) if out.success())
    }

    async fn is_installed(&self, package: &str) -> HostResult<bool> {
        let out = run("dpkg-query", &["-W", "-f=${Status}", package]).await?;
        // dpkg-query exits 1 for unknown packages; that is "not installed".
        Ok(out.success() && parse::parse_dpkg_status(&out.stdout))
    }

    async fn install(&self, packages: &[String]) -> HostResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let noninteractive = [("DEBIAN_FRONTEND", "noninteractive")];

        run_with_env("apt-get", &["update"], &noninteractive)
            .await?
            .check()?;

        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(packages.iter().map(String::as_str));
        info!(packages = ?packages, "Installing packages");
        run_with_env("apt-get", &args, &noninteractive)
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemHost {
    async fn is_active(&self, unit: &str) -> HostResult<bool> {
        Ok(run("systemctl", &["is-active", "--quiet", unit])
            .await?
            .success())
    }

    async fn is_enabled(&self, unit: &str) -> HostResult<bool> {
        Ok(run("systemctl", &["is-enabled", "--quiet", unit])
            .await?
            .success())
    }

    async fn start(&self, unit: &str) -> HostResult<()> {
        run_checked("systemctl", &["start", unit]).await?;
        Ok(())
    }

    async fn stop(&self, unit: &str) -> HostResult<()> {
        run_checked("systemctl", &["stop", unit]).await?;
        Ok(())
    }

    async fn restart(&self, unit: &str) -> HostResult<()> {
        run_checked("systemctl", &["restart", unit]).await?;
        Ok(())
    }

    async fn enable(&self, unit: &str) -> HostResult<()> {
        run_checked("systemctl", &["enable", unit]).await?;
        Ok(())
    }

    async fn unmask(&self, unit: &str) -> HostResult<()> {
        run_checked("systemctl", &["unmask", unit]).await?;
        Ok(())
    }

    async fn journal_tail(&self, unit: &str, lines: usize) -> HostResult<Vec<String>> {
        let count = lines.to_string();
        let out = run_checked(
            "journalctl",
            &["-u", unit, "-n", &count, "--no-pager", "-o", "cat"],
        )
        .await?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl NetworkProbe for SystemHost {
    async fn link_state(&self, iface: &str) -> HostResult<LinkState> {
        let out = run("ip", &["-o", "link", "show", "dev", iface]).await?;
        if !out.success() {
            // `ip` exits non-zero for a device that does not exist.
            return Ok(LinkState::Missing);
        }
        Ok(parse::parse_link_state(&out.stdout))
    }

    async fn ipv4_addresses(&self, iface: &str) -> HostResult<Vec<String>> {
        let out = run("ip", &["-o", "-4", "addr", "show", "dev", iface]).await?;
        if !out.success() {
            return Err(HostError::NotFound {
                kind: "interface",
                name: iface.to_string(),
            });
        }
        Ok(parse::parse_ipv4_addresses(&out.stdout))
    }

    async fn set_link_up(&self, iface: &str) -> HostResult<()> {
        run_checked("ip", &["link", "set", "dev", iface, "up"]).await?;
        Ok(())
    }

    async fn replace_address(&self, iface: &str, cidr: &str) -> HostResult<()> {
        run_checked("ip", &["addr", "replace", cidr, "dev", iface]).await?;
        Ok(())
    }

    async fn default_route_interface(&self) -> HostResult<Option<String>> {
        let out = run_checked("ip", &["-4", "route", "show", "default"]).await?;
        Ok(parse::parse_default_route(&out.stdout))
    }

    async fn is_reachable(&self, host: &str) -> HostResult<bool> {
        let timeout = self.ping_timeout_secs.to_string();
        Ok(run("ping", &["-c", "1", "-W", &timeout, host])
            .await?
            .success())
    }

    async fn listeners(&self, protocol: Protocol) -> HostResult<Vec<Listener>> {
        let flags = match protocol {
            Protocol::Tcp => "-lntp",
            Protocol::Udp => "-lnup",
        };
        let out = run_checked("ss", &["-H", flags]).await?;
        Ok(parse::parse_ss_listeners(protocol, &out.stdout))
    }

    async fn sysctl(&self, key: &str) -> HostResult<String> {
        let out = run_checked("sysctl", &["-n", key]).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn set_sysctl(&self, key: &str, value: &str) -> HostResult<()> {
        let assignment = format!("{key}={value}");
        run_checked("sysctl", &["-w", &assignment]).await?;
        Ok(())
    }

    async fn unblock_wifi(&self) -> HostResult<()> {
        run_checked("rfkill", &["unblock", "wifi"]).await?;
        Ok(())
    }

    async fn set_regulatory_domain(&self, country: &str) -> HostResult<()> {
        let out = run("iw", &["reg", "set", country]).await?;
        if !out.success() {
            // Some drivers pin the domain in firmware; hostapd's country_code still applies.
            warn!(country = %country, stderr = %out.stderr.trim(), "iw reg set was refused");
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for SystemHost {
    async fn has_masquerade(&self, wan_iface: &str) -> HostResult<bool> {
        let out = run_checked("iptables", &["-t", "nat", "-S", "POSTROUTING"]).await?;
        Ok(parse::has_masquerade_rule(&out.stdout, wan_iface))
    }

    async fn load_rules(&self, rules_path: &Path) -> HostResult<()> {
        let path = rules_path.to_string_lossy();
        run_checked("iptables-restore", &[path.as_ref()]).await?;
        Ok(())
    }

    async fn persist_rules(&self) -> HostResult<()> {
        run_checked("netfilter-persistent", &["save"]).await?;
        Ok(())
    }
}

#[async_trait]
impl DaemonTools for SystemHost {
    async fn check_dnsmasq_config(&self, config_path: &Path) -> HostResult<()> {
        let conf = format!("--conf-file={}", config_path.display());
        run_checked("dnsmasq", &["--test", &conf]).await?;
        Ok(())
    }
}
