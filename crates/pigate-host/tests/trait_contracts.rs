//! Trait contract tests for the collaborator traits.
//!
//! These tests pin down the behavior the provisioning engine relies on,
//! using the in-memory fake. Any conforming host implementation must behave
//! the same way.

use std::io::Write;

use pigate_host::fakes::FakeHost;
use pigate_host::traits::*;
use pigate_host::HostError;

// ===========================================================================
// PackageManager contract tests
// ===========================================================================

#[tokio::test]
async fn install_marks_packages_present() {
    let host = FakeHost::new();
    assert!(!host.is_installed("hostapd").await.unwrap());

    host.install(&["hostapd".to_string()]).await.unwrap();

    assert!(host.is_installed("hostapd").await.unwrap());
    assert_eq!(host.install_requests(), vec![vec!["hostapd".to_string()]]);
}

#[tokio::test]
async fn install_without_package_manager_is_missing_tool() {
    let host = FakeHost::new().without_package_manager();
    assert!(!host.is_available().await);

    let err = host.install(&["dnsmasq".to_string()]).await.unwrap_err();
    assert!(err.is_missing_tool());
}

// ===========================================================================
// ServiceManager contract tests
// ===========================================================================

#[tokio::test]
async fn start_and_stop_toggle_active() {
    let host = FakeHost::new().with_unit("dnsmasq", "dnsmasq");

    host.start("dnsmasq").await.unwrap();
    assert!(host.is_active("dnsmasq").await.unwrap());

    host.stop("dnsmasq").await.unwrap();
    assert!(!host.is_active("dnsmasq").await.unwrap());
}

#[tokio::test]
async fn masked_unit_refuses_to_start_until_unmasked() {
    let host = FakeHost::new()
        .with_unit("hostapd", "hostapd")
        .unit_masked("hostapd");

    let err = host.start("hostapd").await.unwrap_err();
    assert!(matches!(err, HostError::CommandFailed { .. }));

    host.unmask("hostapd").await.unwrap();
    host.start("hostapd").await.unwrap();
    assert!(host.is_active("hostapd").await.unwrap());
}

#[tokio::test]
async fn unknown_unit_is_not_found() {
    let host = FakeHost::new();
    let err = host.start("nope").await.unwrap_err();
    assert!(matches!(err, HostError::NotFound { kind: "unit", .. }));
}

#[tokio::test]
async fn unit_cannot_bind_port_held_by_another_process() {
    let host = FakeHost::new()
        .with_unit("dnsmasq", "dnsmasq")
        .unit_binds("dnsmasq", Protocol::Udp, 53);
    host.bind(Protocol::Udp, 53, "named");

    host.start("dnsmasq").await.unwrap();
    assert!(!host.is_active("dnsmasq").await.unwrap());

    let tail = host.journal_tail("dnsmasq", 5).await.unwrap();
    assert!(tail.iter().any(|l| l.contains("Address already in use")));
}

#[tokio::test]
async fn active_unit_holds_its_ports_until_stopped() {
    let host = FakeHost::new()
        .with_unit("dnsmasq", "dnsmasq")
        .unit_binds("dnsmasq", Protocol::Udp, 67);

    host.start("dnsmasq").await.unwrap();
    let listeners = host.listeners(Protocol::Udp).await.unwrap();
    assert!(listeners.iter().any(|l| l.port == 67 && l.is_held_by("dnsmasq")));

    host.stop("dnsmasq").await.unwrap();
    assert!(host.listeners(Protocol::Udp).await.unwrap().is_empty());
}

#[tokio::test]
async fn journal_tail_returns_last_lines() {
    let host = FakeHost::new()
        .with_unit("hostapd", "hostapd")
        .unit_crashes("hostapd", &["one", "two", "three"]);

    assert_eq!(
        host.journal_tail("hostapd", 2).await.unwrap(),
        vec!["two".to_string(), "three".to_string()]
    );
}

// ===========================================================================
// NetworkProbe contract tests
// ===========================================================================

#[tokio::test]
async fn missing_interface_reports_missing() {
    let host = FakeHost::new();
    assert_eq!(host.link_state("wlan9").await.unwrap(), LinkState::Missing);
}

#[tokio::test]
async fn link_becomes_ready_after_polls() {
    let host = FakeHost::new()
        .with_link("wlan0", LinkState::Down)
        .link_ready_after("wlan0", 2);

    assert_eq!(host.link_state("wlan0").await.unwrap(), LinkState::Down);
    assert_eq!(host.link_state("wlan0").await.unwrap(), LinkState::Up);
    assert_eq!(host.link_polls("wlan0"), 2);
}

#[tokio::test]
async fn replace_address_is_idempotent() {
    let host = FakeHost::new().with_link("eth1", LinkState::Down);

    host.replace_address("eth1", "10.0.0.1/24").await.unwrap();
    host.replace_address("eth1", "10.0.0.1/24").await.unwrap();

    assert_eq!(
        host.ipv4_addresses("eth1").await.unwrap(),
        vec!["10.0.0.1/24".to_string()]
    );
}

#[tokio::test]
async fn bind_and_release_are_visible_to_listeners() {
    let host = FakeHost::new();
    host.bind(Protocol::Udp, 53, "unbound");
    assert_eq!(host.listeners(Protocol::Udp).await.unwrap().len(), 1);
    assert!(host.listeners(Protocol::Tcp).await.unwrap().is_empty());

    host.release(Protocol::Udp, 53);
    assert!(host.listeners(Protocol::Udp).await.unwrap().is_empty());
}

#[tokio::test]
async fn sysctl_round_trip() {
    let host = FakeHost::new().with_sysctl("net.ipv4.ip_forward", "0");
    host.set_sysctl("net.ipv4.ip_forward", "1").await.unwrap();
    assert_eq!(host.sysctl("net.ipv4.ip_forward").await.unwrap(), "1");
}

#[tokio::test]
async fn missing_rfkill_is_missing_tool() {
    let host = FakeHost::new().wifi_blocked().without_tool("rfkill");
    let err = host.unblock_wifi().await.unwrap_err();
    assert!(err.is_missing_tool());
    assert!(host.is_wifi_blocked());
}

// ===========================================================================
// Firewall / DaemonTools contract tests
// ===========================================================================

#[tokio::test]
async fn loading_rules_with_masquerade_is_detected() {
    let host = FakeHost::new()
        .with_link("eth0", LinkState::Up)
        .with_link("wlan0", LinkState::Up);

    let mut rules = tempfile::NamedTempFile::new().unwrap();
    writeln!(rules, "*nat").unwrap();
    writeln!(rules, "-A POSTROUTING -o eth0 -j MASQUERADE").unwrap();
    writeln!(rules, "COMMIT").unwrap();

    host.load_rules(rules.path()).await.unwrap();

    assert!(host.has_masquerade("eth0").await.unwrap());
    assert!(!host.has_masquerade("wlan0").await.unwrap());
}

#[tokio::test]
async fn dnsmasq_check_fails_for_missing_file() {
    let host = FakeHost::new();
    let dir = tempfile::tempdir().unwrap();
    let err = host
        .check_dnsmasq_config(&dir.path().join("absent.conf"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::CommandFailed { .. }));
}

#[tokio::test]
async fn router_preset_has_resolver_on_port_53() {
    let host = FakeHost::router("eth0", "wlan0");
    let udp = host.listeners(Protocol::Udp).await.unwrap();
    assert!(udp
        .iter()
        .any(|l| l.port == 53 && l.is_held_by("systemd-resolve")));
    assert!(host.is_active("dhcpcd").await.unwrap());
    assert!(!host.is_active("hostapd").await.unwrap());
    assert_eq!(
        host.default_route_interface().await.unwrap(),
        Some("eth0".to_string())
    );
}
