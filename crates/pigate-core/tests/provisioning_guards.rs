//! Guards, lifecycle and rendering exercised through the public API.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use pigate_core::fixtures::sample_settings;
use pigate_core::{
    ensure_port_available, health_report, interface_up, upsert_managed_block, ManagedBlock,
    ManagedService, PigateError, PortStatus, RetryPolicy, ServiceLifecycle, Template,
    TemplateError, TemplateName, TemplateSet,
};
use pigate_host::fakes::FakeHost;
use pigate_host::{LinkState, Protocol};

/// Test: a foreign DNS server on port 53 is a conflict naming the holder
#[tokio::test]
async fn test_foreign_port_holder_is_a_conflict() {
    let host = FakeHost::new();
    host.bind(Protocol::Udp, 53, "named");

    let err = ensure_port_available(&host, Protocol::Udp, 53, "dnsmasq")
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("named"));
    assert!(!host.calls().iter().any(|c| c.starts_with("stop")));
}

/// Test: the stub resolver is stopped once and the port becomes free
#[tokio::test]
async fn test_stub_resolver_is_recovered() {
    let host = FakeHost::router("eth0", "wlan0");

    let status = ensure_port_available(&host, Protocol::Udp, 53, "dnsmasq")
        .await
        .unwrap();

    assert_eq!(
        status,
        PortStatus::Recovered {
            holder: "systemd-resolve".to_string(),
            unit: "systemd-resolved".to_string(),
        }
    );
    assert_eq!(
        host.calls()
            .iter()
            .filter(|c| *c == "stop systemd-resolved")
            .count(),
        1
    );

    let again = ensure_port_available(&host, Protocol::Udp, 53, "dnsmasq")
        .await
        .unwrap();
    assert_eq!(again, PortStatus::Free);
}

/// Test: our own running dnsmasq is recognised by its unit name
#[tokio::test]
async fn test_running_dnsmasq_holds_its_own_port() {
    let host = FakeHost::new()
        .with_unit("dnsmasq", "dnsmasq")
        .unit_binds("dnsmasq", Protocol::Udp, 53)
        .unit_binds("dnsmasq", Protocol::Udp, 67)
        .unit_active("dnsmasq");

    for port in [53, 67] {
        let status = ensure_port_available(&host, Protocol::Udp, port, ManagedService::DnsDhcp.unit())
            .await
            .unwrap();
        assert_eq!(status, PortStatus::HeldByOwner);
    }
    assert!(host.calls().is_empty());
}

/// Test: a crashing unit surfaces its journal tail
#[tokio::test(start_paused = true)]
async fn test_service_start_failure_carries_log_tail() {
    let host = FakeHost::router("eth0", "wlan0").unit_crashes(
        "hostapd",
        &["wlan0: interface state UNINITIALIZED->DISABLED", "nl80211 driver initialization failed"],
    );
    let lifecycle =
        ServiceLifecycle::new(&host).with_settle(RetryPolicy::new(3, Duration::from_secs(1)));

    let err = lifecycle
        .ensure_started(ManagedService::AccessPoint)
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 3);
    let text = err.to_string();
    assert!(text.contains("hostapd"));
    assert!(text.contains("last log lines"));
    assert!(text.contains("nl80211 driver initialization failed"));
    assert!(host.calls().contains(&"unmask hostapd".to_string()));
}

/// Test: a link that comes up on the fourth poll is waited for
#[tokio::test(start_paused = true)]
async fn test_interface_up_waits_for_link() {
    let host = FakeHost::router("eth0", "wlan0").link_ready_after("eth0", 4);

    let start = tokio::time::Instant::now();
    assert!(interface_up(&host, "eth0", RetryPolicy::interface()).await);
    assert_eq!(host.link_polls("eth0"), 4);
    assert_eq!(start.elapsed(), Duration::from_secs(3));

    let host = FakeHost::router("eth0", "wlan0").with_link("eth0", LinkState::Down);
    assert!(!interface_up(&host, "eth0", RetryPolicy::new(2, Duration::from_secs(1))).await);
}

/// Test: every unresolved placeholder is reported at once
#[test]
fn test_unresolved_placeholders_are_listed() {
    let settings = sample_settings(&[]).unwrap();
    let template = Template::new("custom.conf", "a={{NOT_SET}}\nb={{ALSO_NOT_SET}}\nc={{AP_SSID}}\n");

    match template.render(&settings) {
        Err(TemplateError::Unresolved { template, keys }) => {
            assert_eq!(template, "custom.conf");
            assert_eq!(keys, vec!["NOT_SET".to_string(), "ALSO_NOT_SET".to_string()]);
        }
        other => panic!("expected Unresolved, got {other:?}"),
    }
}

/// Test: an override directory wins over the bundled template
#[test]
fn test_template_override_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(TemplateName::SysctlForwarding.file_name()),
        "net.ipv4.ip_forward=1\nnet.ipv4.conf.all.rp_filter=1\n",
    )
    .unwrap();
    let settings = sample_settings(&[]).unwrap();
    let set = TemplateSet::with_overrides(dir.path());

    let sysctl = set
        .get(TemplateName::SysctlForwarding)
        .unwrap()
        .render(&settings)
        .unwrap();
    assert!(sysctl.contains("rp_filter"));

    let hostapd = set.get(TemplateName::HostapdConf).unwrap().render(&settings).unwrap();
    assert!(hostapd.contains("ssid=pigate"));
}

/// Test: managed block edits keep foreign lines and the file mode
#[test]
fn test_managed_block_keeps_foreign_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dhcpcd.conf");
    std::fs::write(&path, "hostname\n# BEGIN pigate lan\nold\n# END pigate lan\noption ntp_servers\n")
        .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
    let block = ManagedBlock::named("lan");

    let outcome = upsert_managed_block(&path, &block, "interface wlan0\n").unwrap();
    assert!(outcome.is_written());

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        text,
        "hostname\noption ntp_servers\n\n# BEGIN pigate lan\ninterface wlan0\n# END pigate lan\n"
    );
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640);

    let again = upsert_managed_block(&path, &block, "interface wlan0\n").unwrap();
    assert!(!again.is_written());
    assert_eq!(outcome.digest(), again.digest());
}

/// Test: a freshly imaged host reports the router as unhealthy
#[tokio::test]
async fn test_health_report_on_unprovisioned_host() {
    let settings = sample_settings(&[]).unwrap();
    let host = FakeHost::router("eth0", "wlan0");

    let report = health_report(&settings, &host).await;

    assert!(!report.ok);
    let failing = report.failing_names();
    for name in ["lan_link", "lan_address", "hostapd_active", "nat_masquerade", "ipv4_forwarding"] {
        assert!(failing.contains(&name.to_string()), "{name} should fail");
    }
    assert!(report.check("wan_link").unwrap().ok);

    let err = PigateError::HealthCheckFailed { failing };
    assert_eq!(err.exit_code(), 6);
}
