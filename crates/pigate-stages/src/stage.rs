//! Stage names, the stage trait and the context every stage runs with.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pigate_core::{
    PigateError, Result, RetryPolicy, ServiceLifecycle, Settings, TargetPaths, TemplateSet,
};
use pigate_host::Host;
use serde::{Deserialize, Serialize};

/// The provisioning stages, in their fixed execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    /// Packages, radio unblock, regulatory domain.
    Prep,

    /// Uplink link, address, route and reachability.
    WanCheck,

    /// Static LAN address.
    LanConfig,

    /// hostapd and dnsmasq configuration and restart.
    ApDhcpConfig,

    /// IPv4 forwarding and MASQUERADE.
    NatForwarding,

    /// Aggregated health report.
    HealthCheck,

    /// Enable on boot and persist firewall rules.
    Finalize,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::Prep,
        StageName::WanCheck,
        StageName::LanConfig,
        StageName::ApDhcpConfig,
        StageName::NatForwarding,
        StageName::HealthCheck,
        StageName::Finalize,
    ];

    /// Get the stage name as used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            StageName::Prep => "prep",
            StageName::WanCheck => "wan-check",
            StageName::LanConfig => "lan-config",
            StageName::ApDhcpConfig => "ap-dhcp-config",
            StageName::NatForwarding => "nat-forwarding",
            StageName::HealthCheck => "health-check",
            StageName::Finalize => "finalize",
        }
    }

    /// 1-based position in the declared order.
    pub fn position(&self) -> usize {
        StageName::ALL
            .iter()
            .position(|s| s == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-").to_ascii_lowercase();
        StageName::ALL
            .into_iter()
            .find(|stage| stage.name() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = StageName::ALL.iter().map(|s| s.name()).collect();
                format!("unknown stage {s:?} (expected one of: {})", known.join(", "))
            })
    }
}

/// Knobs that shape a run without changing what it converges to.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Treat WAN problems as fatal instead of warnings.
    pub strict_wan: bool,

    /// Pause between consecutive stages.
    pub pause: Duration,

    /// Polling for interfaces to appear or come up.
    pub interface_retry: RetryPolicy,

    /// Polling for services to report active.
    pub settle: RetryPolicy,

    /// Journal lines attached to a service start failure.
    pub tail_lines: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            strict_wan: false,
            pause: Duration::from_secs(2),
            interface_retry: RetryPolicy::interface(),
            settle: RetryPolicy::settle(),
            tail_lines: pigate_core::services::DEFAULT_TAIL_LINES,
        }
    }
}

/// Everything a stage may read or drive.
pub struct StageContext {
    pub settings: Settings,
    pub paths: TargetPaths,
    pub host: Arc<dyn Host>,
    pub templates: TemplateSet,
    pub options: RunOptions,
}

impl StageContext {
    pub fn new(settings: Settings, paths: TargetPaths, host: Arc<dyn Host>) -> Self {
        Self {
            settings,
            paths,
            host,
            templates: TemplateSet::builtin(),
            options: RunOptions::default(),
        }
    }

    pub fn with_templates(mut self, templates: TemplateSet) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    /// Service lifecycle bound to this context's host and settle policy.
    pub fn lifecycle(&self) -> ServiceLifecycle<'_, dyn Host> {
        ServiceLifecycle::new(self.host.as_ref())
            .with_settle(self.options.settle)
            .with_tail_lines(self.options.tail_lines)
    }
}

/// One provisioning stage.
///
/// `apply` must be safe to run any number of times and must converge to the
/// same host state whether the stage runs alone or inside a full run.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Checked before anything is changed.
    async fn precondition(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()>;

    /// Checked after `apply`; a failed postcondition is a
    /// [`PigateError::VerificationFailed`].
    async fn verify(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }
}

/// Shorthand for a failed postcondition.
pub(crate) fn verification_failed(stage: StageName, what: impl fmt::Display) -> PigateError {
    PigateError::VerificationFailed(format!("{stage}: {what}"))
}
