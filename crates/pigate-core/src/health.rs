//! Aggregated health report.
//!
//! The report only reads host state. Probe errors are recorded as failed
//! checks so one broken tool never hides the rest of the picture.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use pigate_host::{Firewall, Host, HostResult, NetworkProbe, Protocol, ServiceManager};
use serde::Serialize;

use crate::config::Settings;
use crate::guards::port_holders;
use crate::services::ManagedService;

/// One named probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl HealthCheck {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            detail: detail.into(),
        }
    }

    fn from_probe<T>(name: &str, probe: HostResult<T>, judge: impl FnOnce(T) -> (bool, String)) -> Self {
        match probe {
            Ok(value) => {
                let (ok, detail) = judge(value);
                Self {
                    name: name.to_string(),
                    ok,
                    detail,
                }
            }
            Err(e) => Self::fail(name, format!("probe error: {e}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub ok: bool,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        Self {
            generated_at: Utc::now(),
            ok: checks.iter().all(|c| c.ok),
            checks,
        }
    }

    pub fn failing(&self) -> Vec<&HealthCheck> {
        self.checks.iter().filter(|c| !c.ok).collect()
    }

    pub fn failing_names(&self) -> Vec<String> {
        self.failing().iter().map(|c| c.name.clone()).collect()
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Aligned plain-text rendering.
    pub fn render_text(&self) -> String {
        let width = self.checks.iter().map(|c| c.name.len()).max().unwrap_or(0);
        let mut out = String::new();
        let _ = writeln!(out, "Health report ({})", self.generated_at.to_rfc3339());
        for check in &self.checks {
            let mark = if check.ok { "✓" } else { "✗" };
            let _ = writeln!(out, "  {mark} {:<width$}  {}", check.name, check.detail);
        }
        let passed = self.checks.iter().filter(|c| c.ok).count();
        let _ = writeln!(
            out,
            "{}: {passed}/{} checks passed",
            if self.ok { "HEALTHY" } else { "UNHEALTHY" },
            self.checks.len()
        );
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Probe the host and build a fresh report.
pub async fn health_report<H: Host + ?Sized>(settings: &Settings, host: &H) -> HealthReport {
    let wan = settings.wan_iface.as_str();
    let lan = settings.lan_iface.as_str();
    let lan_cidr = settings.lan_cidr.to_string();

    let mut checks = Vec::new();

    checks.push(HealthCheck::from_probe("wan_link", host.link_state(wan).await, |s| {
        (s.is_up(), format!("{wan} {s}"))
    }));
    checks.push(HealthCheck::from_probe(
        "wan_address",
        host.ipv4_addresses(wan).await,
        |addrs| {
            if addrs.is_empty() {
                (false, format!("{wan} has no IPv4 address"))
            } else {
                (true, format!("{wan} {}", addrs.join(", ")))
            }
        },
    ));
    checks.push(HealthCheck::from_probe("lan_link", host.link_state(lan).await, |s| {
        (s.is_up(), format!("{lan} {s}"))
    }));
    checks.push(HealthCheck::from_probe(
        "lan_address",
        host.ipv4_addresses(lan).await,
        |addrs| {
            let ok = addrs.iter().any(|a| *a == lan_cidr);
            let have = if addrs.is_empty() {
                "none".to_string()
            } else {
                addrs.join(", ")
            };
            (ok, format!("{lan} expected {lan_cidr}, has {have}"))
        },
    ));

    for (name, service) in [
        ("hostapd_active", ManagedService::AccessPoint),
        ("dnsmasq_active", ManagedService::DnsDhcp),
    ] {
        checks.push(HealthCheck::from_probe(
            name,
            host.is_active(service.unit()).await,
            |active| {
                let state = if active { "active" } else { "inactive" };
                (active, format!("{service} {state}"))
            },
        ));
    }

    checks.push(HealthCheck::from_probe(
        "nat_masquerade",
        host.has_masquerade(wan).await,
        |present| {
            if present {
                (true, format!("MASQUERADE on {wan}"))
            } else {
                (false, format!("no MASQUERADE rule for {wan}"))
            }
        },
    ));
    checks.push(HealthCheck::from_probe(
        "ipv4_forwarding",
        host.sysctl("net.ipv4.ip_forward").await,
        |value| (value.trim() == "1", format!("net.ipv4.ip_forward = {}", value.trim())),
    ));

    for (name, port) in [("port_udp_53", 53), ("port_udp_67", 67)] {
        let owner = ManagedService::DnsDhcp.unit();
        let check = match port_holders(host, Protocol::Udp, port).await {
            Ok(holders) => {
                let foreign: Vec<String> = holders
                    .iter()
                    .filter(|l| !l.is_held_by(owner))
                    .map(|l| l.process.clone().unwrap_or_else(|| "unknown".to_string()))
                    .collect();
                if foreign.is_empty() {
                    HealthCheck::pass(name, format!("udp/{port} free of conflicts"))
                } else {
                    HealthCheck::fail(name, format!("udp/{port} held by {}", foreign.join(", ")))
                }
            }
            Err(e) => HealthCheck::fail(name, format!("probe error: {e}")),
        };
        checks.push(check);
    }

    let report = HealthReport::new(checks);
    if report.ok {
        tracing::info!(checks = report.checks.len(), "Health report OK");
    } else {
        tracing::warn!(failing = ?report.failing_names(), "Health report has failures");
    }
    report
}
