//! Lifecycle of the daemons pigate manages.

use std::fmt;
use std::str::FromStr;

use pigate_host::{HostError, ServiceManager};
use serde::Serialize;

use crate::error::{PigateError, Result};
use crate::retry::RetryPolicy;

/// Default number of journal lines attached to a start failure.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// A daemon under pigate's control.
///
/// Variants are declared in dependency order: the DHCP client must hold the
/// LAN address before the access point comes up, and the DNS/DHCP server
/// binds to that address last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedService {
    DhcpClient,
    AccessPoint,
    DnsDhcp,
    FirewallPersistence,
}

impl ManagedService {
    pub const ALL: [ManagedService; 4] = [
        ManagedService::DhcpClient,
        ManagedService::AccessPoint,
        ManagedService::DnsDhcp,
        ManagedService::FirewallPersistence,
    ];

    /// systemd unit name.
    pub fn unit(&self) -> &'static str {
        match self {
            ManagedService::DhcpClient => "dhcpcd",
            ManagedService::AccessPoint => "hostapd",
            ManagedService::DnsDhcp => "dnsmasq",
            ManagedService::FirewallPersistence => "netfilter-persistent",
        }
    }
}

impl fmt::Display for ManagedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.unit())
    }
}

impl FromStr for ManagedService {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ManagedService::ALL
            .into_iter()
            .find(|svc| svc.unit() == s)
            .ok_or_else(|| format!("unknown service: {s}"))
    }
}

/// Stop/start/enable with post-start verification.
pub struct ServiceLifecycle<'a, S: ServiceManager + ?Sized> {
    services: &'a S,
    settle: RetryPolicy,
    tail_lines: usize,
}

impl<'a, S: ServiceManager + ?Sized> ServiceLifecycle<'a, S> {
    pub fn new(services: &'a S) -> Self {
        Self {
            services,
            settle: RetryPolicy::settle(),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_settle(mut self, settle: RetryPolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    /// Stop `service` if it is running.
    pub async fn ensure_stopped(&self, service: ManagedService) -> Result<()> {
        let unit = service.unit();
        if !self.services.is_active(unit).await? {
            tracing::debug!(service = unit, "Already stopped");
            return Ok(());
        }
        tracing::info!(service = unit, "Stopping");
        self.services.stop(unit).await?;
        Ok(())
    }

    /// Unmask and start `service`, then wait for it to report active.
    pub async fn ensure_started(&self, service: ManagedService) -> Result<()> {
        let unit = service.unit();
        self.services.unmask(unit).await?;

        if self.services.is_active(unit).await? {
            tracing::debug!(service = unit, "Already active");
            return Ok(());
        }

        tracing::info!(service = unit, "Starting");
        if let Err(e) = self.services.start(unit).await {
            return Err(self.start_failure(service, start_error_reason(e)?).await);
        }
        self.settle(service).await
    }

    /// Unmask and restart `service`, then wait for it to report active.
    pub async fn restart(&self, service: ManagedService) -> Result<()> {
        let unit = service.unit();
        self.services.unmask(unit).await?;

        tracing::info!(service = unit, "Restarting");
        if let Err(e) = self.services.restart(unit).await {
            return Err(self.start_failure(service, start_error_reason(e)?).await);
        }
        self.settle(service).await
    }

    /// Enable `service` at boot unless it already is.
    pub async fn enable_on_boot(&self, service: ManagedService) -> Result<()> {
        let unit = service.unit();
        if self.services.is_enabled(unit).await? {
            tracing::debug!(service = unit, "Already enabled");
            return Ok(());
        }
        tracing::info!(service = unit, "Enabling on boot");
        self.services.enable(unit).await?;
        Ok(())
    }

    /// Restart `services` in dependency order regardless of the order given.
    pub async fn restart_in_order(&self, services: &[ManagedService]) -> Result<()> {
        let mut ordered = services.to_vec();
        ordered.sort();
        ordered.dedup();
        for service in ordered {
            self.restart(service).await?;
        }
        Ok(())
    }

    async fn settle(&self, service: ManagedService) -> Result<()> {
        let unit = service.unit();
        let services = self.services;
        let label = format!("service {unit}");
        let settled = self
            .settle
            .poll(&label, || async move {
                match services.is_active(unit).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("inactive".to_string()),
                    Err(e) => Err(format!("status query failed: {e}")),
                }
            })
            .await;

        match settled {
            Ok(_) => {
                tracing::info!(service = unit, "Active");
                Ok(())
            }
            Err(exhausted) => Err(self
                .start_failure(
                    service,
                    format!("not active after {} check(s)", exhausted.attempts),
                )
                .await),
        }
    }

    async fn start_failure(&self, service: ManagedService, reason: String) -> PigateError {
        let unit = service.unit();
        let log_tail = match self.services.journal_tail(unit, self.tail_lines).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(service = unit, error = %e, "Could not read journal");
                Vec::new()
            }
        };
        tracing::error!(service = unit, reason = %reason, "Service failed to start");
        PigateError::ServiceStart {
            service: unit.to_string(),
            reason,
            log_tail,
        }
    }
}

/// A failed start job becomes a start failure; a missing tool does not.
fn start_error_reason(e: HostError) -> Result<String> {
    match e {
        HostError::CommandFailed { stderr, status, .. } => {
            Ok(format!("start job failed (exit {status}): {}", stderr.trim()))
        }
        other => Err(other.into()),
    }
}
