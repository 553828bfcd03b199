//! The seven provisioning stages.

use async_trait::async_trait;
use pigate_core::guards::{ensure_packages, ensure_port_available, interface_up, package_present};
use pigate_core::{
    health_report, scratch_file, upsert_managed_block, ConfigError, ManagedBlock, ManagedService,
    PigateError, Result, TemplateName,
};
use pigate_host::{
    DaemonTools, Firewall, LinkState, NetworkProbe, PackageManager, Protocol, ServiceManager,
};

use crate::stage::{verification_failed, Stage, StageContext, StageName};

/// Packages the access point needs.
pub const PACKAGES: &[&str] = &[
    "hostapd",
    "dnsmasq",
    "iptables",
    "iptables-persistent",
    "rfkill",
    "iw",
];

/// Managed block name in the DHCP client config.
pub const LAN_BLOCK: &str = "lan";
/// Managed block name in the hostapd defaults file.
pub const HOSTAPD_DEFAULT_BLOCK: &str = "hostapd";

/// Health checks that only fail the run in strict WAN mode.
const WAN_CHECKS: &[&str] = &["wan_link", "wan_address"];

/// Build the stage implementation for `name`.
pub fn builtin(name: StageName) -> Box<dyn Stage> {
    match name {
        StageName::Prep => Box::new(Prep),
        StageName::WanCheck => Box::new(WanCheck),
        StageName::LanConfig => Box::new(LanConfig),
        StageName::ApDhcpConfig => Box::new(ApDhcpConfig),
        StageName::NatForwarding => Box::new(NatForwarding),
        StageName::HealthCheck => Box::new(HealthCheck),
        StageName::Finalize => Box::new(Finalize),
    }
}

/// Wait for `iface` to exist, using the interface retry policy.
async fn require_interface(ctx: &StageContext, iface: &str) -> Result<()> {
    let host = ctx.host();
    let label = format!("interface {iface} present");
    ctx.options
        .interface_retry
        .poll(&label, || async move {
            match host.link_state(iface).await {
                Ok(LinkState::Missing) => Err("missing".to_string()),
                Ok(_) => Ok(()),
                Err(e) => Err(format!("probe failed: {e}")),
            }
        })
        .await
        .map(|_| ())
        .map_err(|exhausted| PigateError::InterfaceNotReady {
            iface: iface.to_string(),
            attempts: exhausted.attempts,
        })
}

// ---------------------------------------------------------------------------
// Prep
// ---------------------------------------------------------------------------

pub struct Prep;

#[async_trait]
impl Stage for Prep {
    fn name(&self) -> StageName {
        StageName::Prep
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();

        let report = ensure_packages(host, PACKAGES).await?;
        tracing::info!(
            installed = report.installed.len(),
            present = report.already_present.len(),
            skipped = report.skipped.len(),
            "Packages checked"
        );

        match host.unblock_wifi().await {
            Ok(()) => tracing::info!("Wi-Fi radio unblocked"),
            Err(e) if e.is_missing_tool() => {
                tracing::warn!("rfkill not available; cannot clear a soft block on the radio")
            }
            Err(e) => return Err(e.into()),
        }

        let country = ctx.settings.country_code.as_str();
        match host.set_regulatory_domain(country).await {
            Ok(()) => tracing::info!(country, "Regulatory domain set"),
            Err(e) if e.is_missing_tool() => {
                tracing::warn!(country, "iw not available; regulatory domain left as is")
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(dir) = ctx.settings.lease_file.parent() {
            let dir = ctx.paths.resolve(dir);
            std::fs::create_dir_all(&dir)?;
            tracing::debug!(path = %dir.display(), "Lease directory ready");
        }
        Ok(())
    }

    async fn verify(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();

        if let Some(dir) = ctx.settings.lease_file.parent() {
            let dir = ctx.paths.resolve(dir);
            if !dir.is_dir() {
                return Err(PigateError::MissingDirectory(dir));
            }
        }

        let mut missing = Vec::new();
        for package in PACKAGES {
            if !package_present(host, package).await? {
                missing.push(*package);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        if !host.is_available().await {
            tracing::warn!(missing = ?missing, "Packages missing and no package manager to install them");
            return Ok(());
        }
        Err(verification_failed(
            StageName::Prep,
            format!("packages still missing: {}", missing.join(", ")),
        ))
    }
}

// ---------------------------------------------------------------------------
// WanCheck
// ---------------------------------------------------------------------------

pub struct WanCheck;

#[async_trait]
impl Stage for WanCheck {
    fn name(&self) -> StageName {
        StageName::WanCheck
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();
        let wan = ctx.settings.wan_iface.as_str();
        let mut problems = Vec::new();

        if !interface_up(host, wan, ctx.options.interface_retry).await {
            problems.push(format!("{wan} link is not up"));
        }

        match host.ipv4_addresses(wan).await {
            Ok(addrs) if !addrs.is_empty() => {
                tracing::info!(iface = wan, addresses = ?addrs, "WAN address present")
            }
            Ok(_) => problems.push(format!("{wan} has no IPv4 address")),
            Err(e) => problems.push(format!("cannot read {wan} addresses: {e}")),
        }

        match host.default_route_interface().await {
            Ok(Some(iface)) if iface == wan => {}
            Ok(Some(iface)) => problems.push(format!("default route uses {iface}, not {wan}")),
            Ok(None) => problems.push("no IPv4 default route".to_string()),
            Err(e) => problems.push(format!("cannot read default route: {e}")),
        }

        let target = ctx.settings.wan_check_host.as_str();
        match host.is_reachable(target).await {
            Ok(true) => tracing::info!(host = target, "Upstream reachable"),
            Ok(false) => problems.push(format!("{target} is unreachable")),
            Err(e) => problems.push(format!("cannot ping {target}: {e}")),
        }

        if problems.is_empty() {
            return Ok(());
        }
        if ctx.options.strict_wan {
            return Err(PigateError::WanUnavailable(problems.join("; ")));
        }
        for problem in &problems {
            tracing::warn!(problem = %problem, "WAN check");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LanConfig
// ---------------------------------------------------------------------------

pub struct LanConfig;

#[async_trait]
impl Stage for LanConfig {
    fn name(&self) -> StageName {
        StageName::LanConfig
    }

    async fn precondition(&self, ctx: &StageContext) -> Result<()> {
        require_interface(ctx, &ctx.settings.lan_iface).await
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();
        let lan = ctx.settings.lan_iface.as_str();
        let cidr = ctx.settings.lan_cidr.to_string();

        let body = ctx
            .templates
            .get(TemplateName::DhcpcdStatic)?
            .render(&ctx.settings)?;
        let outcome = upsert_managed_block(
            &ctx.paths.dhcpcd_conf(),
            &ManagedBlock::named(LAN_BLOCK),
            &body,
        )?;
        tracing::info!(iface = lan, cidr = %cidr, written = outcome.is_written(), "Static LAN address configured");

        host.replace_address(lan, &cidr).await?;
        host.set_link_up(lan).await?;
        Ok(())
    }

    async fn verify(&self, ctx: &StageContext) -> Result<()> {
        let path = ctx.paths.dhcpcd_conf();
        let text = std::fs::read_to_string(&path)?;
        let begin = ManagedBlock::named(LAN_BLOCK).begin_marker();
        let blocks = text.lines().filter(|l| l.trim() == begin).count();
        if blocks != 1 {
            return Err(verification_failed(
                StageName::LanConfig,
                format!("{} has {blocks} managed LAN blocks", path.display()),
            ));
        }

        let lan = ctx.settings.lan_iface.as_str();
        let cidr = ctx.settings.lan_cidr.to_string();
        let addrs = ctx.host().ipv4_addresses(lan).await?;
        if !addrs.iter().any(|a| *a == cidr) {
            return Err(verification_failed(
                StageName::LanConfig,
                format!("{lan} does not carry {cidr}"),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ApDhcpConfig
// ---------------------------------------------------------------------------

pub struct ApDhcpConfig;

#[async_trait]
impl Stage for ApDhcpConfig {
    fn name(&self) -> StageName {
        StageName::ApDhcpConfig
    }

    async fn precondition(&self, ctx: &StageContext) -> Result<()> {
        require_interface(ctx, &ctx.settings.lan_iface).await
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();
        let lifecycle = ctx.lifecycle();

        // Validate the DNS/DHCP config before touching anything live.
        let dnsmasq_conf = ctx.paths.dnsmasq_conf();
        let dnsmasq = ctx.templates.get(TemplateName::DnsmasqConf)?;
        let candidate = scratch_file(&dnsmasq_conf, &dnsmasq.render(&ctx.settings)?)?;
        host.check_dnsmasq_config(candidate.path()).await?;
        drop(candidate);

        lifecycle.ensure_stopped(ManagedService::AccessPoint).await?;
        lifecycle.ensure_stopped(ManagedService::DnsDhcp).await?;

        ctx.templates
            .get(TemplateName::HostapdConf)?
            .install(&ctx.paths.hostapd_conf(), &ctx.settings)?;
        let defaults = ctx
            .templates
            .get(TemplateName::HostapdDefault)?
            .render(&ctx.settings)?;
        upsert_managed_block(
            &ctx.paths.hostapd_default(),
            &ManagedBlock::named(HOSTAPD_DEFAULT_BLOCK),
            &defaults,
        )?;

        let owner = ManagedService::DnsDhcp.unit();
        for (protocol, port) in [(Protocol::Udp, 53), (Protocol::Tcp, 53), (Protocol::Udp, 67)] {
            let status = ensure_port_available(host, protocol, port, owner).await?;
            tracing::debug!(port, protocol = %protocol, status = ?status, "Port checked");
        }

        dnsmasq.install(&dnsmasq_conf, &ctx.settings)?;

        lifecycle
            .restart_in_order(&[
                ManagedService::DhcpClient,
                ManagedService::AccessPoint,
                ManagedService::DnsDhcp,
            ])
            .await
    }

    async fn verify(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();
        for service in [ManagedService::AccessPoint, ManagedService::DnsDhcp] {
            if !host.is_active(service.unit()).await? {
                return Err(verification_failed(
                    StageName::ApDhcpConfig,
                    format!("{service} is not active"),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NatForwarding
// ---------------------------------------------------------------------------

pub struct NatForwarding;

#[async_trait]
impl Stage for NatForwarding {
    fn name(&self) -> StageName {
        StageName::NatForwarding
    }

    async fn precondition(&self, ctx: &StageContext) -> Result<()> {
        if ctx.settings.wan_iface == ctx.settings.lan_iface {
            return Err(ConfigError::Invalid {
                key: "LAN_IFACE".to_string(),
                reason: "must differ from WAN_IFACE".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();

        ctx.templates
            .get(TemplateName::SysctlForwarding)?
            .install(&ctx.paths.sysctl_forwarding(), &ctx.settings)?;
        host.set_sysctl("net.ipv4.ip_forward", "1").await?;

        let rules = ctx.paths.rules_v4();
        ctx.templates
            .get(TemplateName::RulesV4)?
            .install(&rules, &ctx.settings)?;
        host.load_rules(&rules).await?;
        tracing::info!(wan = %ctx.settings.wan_iface, "NAT rules loaded");
        Ok(())
    }

    async fn verify(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();
        let wan = ctx.settings.wan_iface.as_str();
        if !host.has_masquerade(wan).await? {
            return Err(verification_failed(
                StageName::NatForwarding,
                format!("no MASQUERADE rule for {wan}"),
            ));
        }
        let forwarding = host.sysctl("net.ipv4.ip_forward").await?;
        if forwarding.trim() != "1" {
            return Err(verification_failed(
                StageName::NatForwarding,
                format!("net.ipv4.ip_forward is {}", forwarding.trim()),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HealthCheck
// ---------------------------------------------------------------------------

pub struct HealthCheck;

#[async_trait]
impl Stage for HealthCheck {
    fn name(&self) -> StageName {
        StageName::HealthCheck
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let report = health_report(&ctx.settings, ctx.host()).await;

        let mut failing = Vec::new();
        for check in report.failing() {
            if !ctx.options.strict_wan && WAN_CHECKS.contains(&check.name.as_str()) {
                tracing::warn!(check = %check.name, detail = %check.detail, "WAN health check failed; not fatal without strict WAN");
                continue;
            }
            tracing::warn!(check = %check.name, detail = %check.detail, "Health check failed");
            failing.push(check.name.clone());
        }

        if failing.is_empty() {
            Ok(())
        } else {
            Err(PigateError::HealthCheckFailed { failing })
        }
    }
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

pub struct Finalize;

#[async_trait]
impl Stage for Finalize {
    fn name(&self) -> StageName {
        StageName::Finalize
    }

    async fn apply(&self, ctx: &StageContext) -> Result<()> {
        let lifecycle = ctx.lifecycle();
        for service in ManagedService::ALL {
            lifecycle.enable_on_boot(service).await?;
        }
        ctx.host().persist_rules().await?;
        tracing::info!("Firewall rules persisted");
        Ok(())
    }

    async fn verify(&self, ctx: &StageContext) -> Result<()> {
        let host = ctx.host();
        for service in ManagedService::ALL {
            if !host.is_enabled(service.unit()).await? {
                return Err(verification_failed(
                    StageName::Finalize,
                    format!("{service} is not enabled on boot"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pigate_core::fixtures::sample_settings;
    use pigate_core::{RetryPolicy, TargetPaths};
    use pigate_host::fakes::FakeHost;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::stage::RunOptions;

    fn context(host: Arc<FakeHost>, root: &std::path::Path) -> StageContext {
        StageContext::new(
            sample_settings(&[]).unwrap(),
            TargetPaths::new(root),
            host,
        )
        .with_options(RunOptions {
            pause: Duration::ZERO,
            interface_retry: RetryPolicy::new(2, Duration::from_millis(10)),
            settle: RetryPolicy::new(2, Duration::from_millis(10)),
            ..RunOptions::default()
        })
    }

    #[test]
    fn builtin_covers_every_stage() {
        for name in StageName::ALL {
            assert_eq!(builtin(name).name(), name);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prep_tolerates_missing_radio_tools() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(
            FakeHost::router("eth0", "wlan0")
                .without_tool("rfkill")
                .without_tool("iw"),
        );
        let ctx = context(host.clone(), dir.path());

        Prep.apply(&ctx).await.unwrap();
        Prep.verify(&ctx).await.unwrap();

        assert!(host.is_wifi_blocked());
        assert!(dir.path().join("var/lib/misc").is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn prep_sets_radio_state() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0"));
        let ctx = context(host.clone(), dir.path());

        Prep.apply(&ctx).await.unwrap();

        assert!(!host.is_wifi_blocked());
        assert_eq!(host.regulatory_domain(), Some("US".to_string()));
        assert_eq!(host.install_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prep_without_package_manager_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0").without_package_manager());
        let ctx = context(host, dir.path());

        Prep.apply(&ctx).await.unwrap();
        Prep.verify(&ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lan_config_requires_interface() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new().with_link("eth0", LinkState::Up));
        let ctx = context(host, dir.path());

        let err = LanConfig.precondition(&ctx).await.unwrap_err();
        assert!(matches!(err, PigateError::InterfaceNotReady { attempts: 2, .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn wan_check_warns_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0").unreachable());

        let lenient = context(host.clone(), dir.path());
        WanCheck.apply(&lenient).await.unwrap();

        let mut strict = context(host, dir.path());
        strict.options.strict_wan = true;
        let err = WanCheck.apply(&strict).await.unwrap_err();
        assert!(matches!(err, PigateError::WanUnavailable(ref m) if m.contains("1.1.1.1")));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn nat_requires_distinct_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0"));
        let mut ctx = context(host, dir.path());
        ctx.settings = sample_settings(&[("LAN_IFACE", "eth0")]).unwrap();

        let err = NatForwarding.precondition(&ctx).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn nat_forwarding_converges() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0"));
        let ctx = context(host.clone(), dir.path());

        NatForwarding.apply(&ctx).await.unwrap();
        NatForwarding.verify(&ctx).await.unwrap();

        let rules = std::fs::read_to_string(dir.path().join("etc/iptables/rules.v4")).unwrap();
        assert!(rules.contains("-A POSTROUTING -o eth0 -j MASQUERADE"));
        let sysctl =
            std::fs::read_to_string(dir.path().join("etc/sysctl.d/90-pigate-forwarding.conf"))
                .unwrap();
        assert!(sysctl.contains("net.ipv4.ip_forward=1"));
    }

    #[tokio::test(start_paused = true)]
    async fn dnsmasq_rejection_stops_before_restart() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(
            FakeHost::router("eth0", "wlan0").rejecting_dnsmasq_config("bad option at line 3"),
        );
        let ctx = context(host.clone(), dir.path());
        let live = ctx.paths.dnsmasq_conf();
        std::fs::create_dir_all(live.parent().unwrap()).unwrap();
        std::fs::write(&live, "interface=wlan0\n").unwrap();

        let err = ApDhcpConfig.apply(&ctx).await.unwrap_err();
        assert!(matches!(err, PigateError::Host(_)));

        assert_eq!(std::fs::read_to_string(&live).unwrap(), "interface=wlan0\n");
        let leftovers: Vec<_> = std::fs::read_dir(live.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("pigate.conf")]);

        let calls = host.calls();
        assert!(calls.contains(&"check_dnsmasq_config".to_string()));
        assert!(!calls
            .iter()
            .any(|c| c.starts_with("stop") || c.starts_with("restart")));
        assert!(!ctx.paths.hostapd_conf().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_tolerates_wan_outage_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0"));
        let lenient = context(host.clone(), dir.path());
        for stage in [StageName::LanConfig, StageName::ApDhcpConfig, StageName::NatForwarding] {
            builtin(stage).apply(&lenient).await.unwrap();
        }
        host.set_link_state("eth0", LinkState::Down);

        HealthCheck.apply(&lenient).await.unwrap();

        let mut strict = context(host, dir.path());
        strict.options.strict_wan = true;
        let err = HealthCheck.apply(&strict).await.unwrap_err();
        assert!(
            matches!(err, PigateError::HealthCheckFailed { ref failing } if failing == &vec!["wan_link".to_string()])
        );
    }

    #[tokio::test]
    async fn finalize_enables_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::router("eth0", "wlan0"));
        let ctx = context(host.clone(), dir.path());

        Finalize.apply(&ctx).await.unwrap();
        Finalize.verify(&ctx).await.unwrap();

        assert!(host.is_unit_enabled("hostapd"));
        assert!(host.is_unit_enabled("netfilter-persistent"));
        assert_eq!(host.persisted_rules(), 1);
    }
}
