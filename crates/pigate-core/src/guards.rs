//! Idempotency and precondition guards.
//!
//! Guards inspect host state before a stage mutates it. Each one is safe to
//! call any number of times.

use pigate_host::{Listener, LinkState, NetworkProbe, PackageManager, Protocol, ServiceManager};
use serde::Serialize;

use crate::error::{PigateError, Result};
use crate::retry::RetryPolicy;

/// Port holders pigate knows how to move out of the way: (process, unit).
pub const KNOWN_RECOVERIES: &[(&str, &str)] = &[("systemd-resolve", "systemd-resolved")];

// ---------------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------------

/// Result of an `ensure_packages` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageReport {
    pub installed: Vec<String>,
    pub already_present: Vec<String>,
    /// Missing packages that could not be installed because no package
    /// manager is available.
    pub skipped: Vec<String>,
}

impl PackageReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

pub async fn package_present<P: PackageManager + ?Sized>(packages: &P, name: &str) -> Result<bool> {
    match packages.is_installed(name).await {
        Ok(present) => Ok(present),
        Err(e) if e.is_missing_tool() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Install whichever of `names` are not yet present.
///
/// Without a package manager the missing packages are reported as skipped
/// and a warning is logged; the caller decides whether that is fatal.
pub async fn ensure_packages<P: PackageManager + ?Sized>(
    packages: &P,
    names: &[&str],
) -> Result<PackageReport> {
    let mut report = PackageReport::default();
    let mut missing = Vec::new();

    for name in names {
        if package_present(packages, name).await? {
            report.already_present.push(name.to_string());
        } else {
            missing.push(name.to_string());
        }
    }

    if missing.is_empty() {
        tracing::debug!(count = names.len(), "All packages already present");
        return Ok(report);
    }

    if !packages.is_available().await {
        tracing::warn!(missing = ?missing, "No package manager available; skipping install");
        report.skipped = missing;
        return Ok(report);
    }

    tracing::info!(packages = ?missing, "Installing packages");
    packages.install(&missing).await?;
    report.installed = missing;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

pub async fn interface_exists<N: NetworkProbe + ?Sized>(net: &N, iface: &str) -> Result<bool> {
    Ok(net.link_state(iface).await?.exists())
}

/// Wait for `iface` to report link up.
///
/// Polls per `policy`, logging each failed poll and a final diagnostic.
/// Never returns an error: a probe failure counts as a failed poll.
pub async fn interface_up<N: NetworkProbe + ?Sized>(net: &N, iface: &str, policy: RetryPolicy) -> bool {
    let label = format!("interface {iface}");
    let outcome = policy
        .poll(&label, || async move {
            match net.link_state(iface).await {
                Ok(LinkState::Up) => Ok(()),
                Ok(state) => Err(format!("link {state}")),
                Err(e) => Err(format!("probe failed: {e}")),
            }
        })
        .await;

    match outcome {
        Ok(_) => true,
        Err(exhausted) => {
            tracing::warn!(
                iface,
                attempts = exhausted.attempts,
                last = %exhausted.last,
                "Interface never came up; check the cable or driver, `ip link show {iface}` and `rfkill list`"
            );
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Sockets currently bound to `protocol`/`port`.
pub async fn port_holders<N: NetworkProbe + ?Sized>(
    net: &N,
    protocol: Protocol,
    port: u16,
) -> Result<Vec<Listener>> {
    Ok(net
        .listeners(protocol)
        .await?
        .into_iter()
        .filter(|l| l.port == port)
        .collect())
}

pub async fn port_in_use<N: NetworkProbe + ?Sized>(net: &N, protocol: Protocol, port: u16) -> Result<bool> {
    Ok(!port_holders(net, protocol, port).await?.is_empty())
}

/// How a port was made available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PortStatus {
    Free,
    /// Bound by the process that is meant to own it.
    HeldByOwner,
    /// A known foreign holder was stopped.
    Recovered { holder: String, unit: String },
}

fn foreign_holder(holders: &[Listener], owner: &str) -> Option<String> {
    holders
        .iter()
        .find(|l| !l.is_held_by(owner))
        .map(|l| l.process.clone().unwrap_or_else(|| "unknown".to_string()))
}

/// Make sure `owner` can bind `protocol`/`port`.
///
/// A socket held by `owner` itself is not a conflict. A socket held by a
/// process in [`KNOWN_RECOVERIES`] is freed by stopping its unit once;
/// anything else is a [`PigateError::PortConflict`] naming the holder.
pub async fn ensure_port_available<H>(
    host: &H,
    protocol: Protocol,
    port: u16,
    owner: &str,
) -> Result<PortStatus>
where
    H: NetworkProbe + ServiceManager + ?Sized,
{
    let holders = port_holders(host, protocol, port).await?;
    let Some(holder) = foreign_holder(&holders, owner) else {
        return Ok(if holders.is_empty() {
            PortStatus::Free
        } else {
            PortStatus::HeldByOwner
        });
    };

    let conflict = |holder: String| PigateError::PortConflict {
        protocol,
        port,
        holder,
    };

    let Some((_, unit)) = KNOWN_RECOVERIES.iter().find(|(process, _)| *process == holder) else {
        return Err(conflict(holder));
    };

    tracing::warn!(port, protocol = %protocol, holder = %holder, unit, "Stopping conflicting service");
    host.stop(unit).await?;

    let holders = port_holders(host, protocol, port).await?;
    if let Some(still) = foreign_holder(&holders, owner) {
        return Err(conflict(still));
    }
    Ok(PortStatus::Recovered {
        holder,
        unit: unit.to_string(),
    })
}
