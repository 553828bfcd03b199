//! In-memory fake host (testing only)
//!
//! `FakeHost` implements every collaborator trait against a small model of a
//! router host: installed packages, systemd units with the ports they bind,
//! network links, listening sockets, sysctls and loaded NAT rules. Units that
//! try to bind a port already held by another process fail to start, which
//! lets port-conflict handling be exercised end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::HostError;
use crate::parse;
use crate::traits::*;

#[derive(Debug, Clone)]
struct FakeUnit {
    process: String,
    active: bool,
    enabled: bool,
    masked: bool,
    fails_to_start: bool,
    ports: Vec<(Protocol, u16)>,
    journal: Vec<String>,
}

impl FakeUnit {
    fn new(process: &str) -> Self {
        Self {
            process: process.to_string(),
            active: false,
            enabled: false,
            masked: false,
            fails_to_start: false,
            ports: Vec::new(),
            journal: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeLink {
    state: LinkState,
    addresses: Vec<String>,
    ready_after: Option<u32>,
    polls: u32,
}

#[derive(Debug)]
struct FakeState {
    package_manager: bool,
    installed: BTreeSet<String>,
    install_requests: Vec<Vec<String>>,
    units: BTreeMap<String, FakeUnit>,
    links: BTreeMap<String, FakeLink>,
    default_route: Option<String>,
    reachable: bool,
    listeners: Vec<Listener>,
    sysctls: BTreeMap<String, String>,
    masquerade: BTreeSet<String>,
    persisted_rules: u32,
    missing_tools: BTreeSet<String>,
    dnsmasq_rejection: Option<String>,
    wifi_blocked: bool,
    regulatory_domain: Option<String>,
    calls: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            package_manager: true,
            installed: BTreeSet::new(),
            install_requests: Vec::new(),
            units: BTreeMap::new(),
            links: BTreeMap::new(),
            default_route: None,
            reachable: true,
            listeners: Vec::new(),
            sysctls: BTreeMap::new(),
            masquerade: BTreeSet::new(),
            persisted_rules: 0,
            missing_tools: BTreeSet::new(),
            dnsmasq_rejection: None,
            wifi_blocked: false,
            regulatory_domain: None,
            calls: Vec::new(),
        }
    }
}

/// In-memory host used as the test double for the provisioning engine.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A freshly imaged router: WAN up with a DHCP lease and default route,
    /// LAN radio present but down and soft-blocked, hostapd masked, a stub
    /// resolver holding port 53 and forwarding disabled.
    pub fn router(wan: &str, lan: &str) -> Self {
        Self::new()
            .with_link(wan, LinkState::Up)
            .with_address(wan, "192.168.1.20/24")
            .with_default_route(wan)
            .with_link(lan, LinkState::Down)
            .with_unit("dhcpcd", "dhcpcd")
            .with_unit("hostapd", "hostapd")
            .with_unit("dnsmasq", "dnsmasq")
            .with_unit("systemd-resolved", "systemd-resolve")
            .with_unit("netfilter-persistent", "netfilter-persi")
            .unit_active("dhcpcd")
            .unit_enabled("dhcpcd")
            .unit_masked("hostapd")
            .unit_binds("dnsmasq", Protocol::Udp, 53)
            .unit_binds("dnsmasq", Protocol::Tcp, 53)
            .unit_binds("dnsmasq", Protocol::Udp, 67)
            .unit_binds("systemd-resolved", Protocol::Udp, 53)
            .unit_binds("systemd-resolved", Protocol::Tcp, 53)
            .unit_active("systemd-resolved")
            .with_sysctl("net.ipv4.ip_forward", "0")
            .wifi_blocked()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- builders -----------------------------------------------------------

    pub fn with_package(self, package: &str) -> Self {
        self.state().installed.insert(package.to_string());
        self
    }

    pub fn without_package_manager(self) -> Self {
        self.state().package_manager = false;
        self
    }

    /// Make every invocation of `tool` fail as if it were not installed.
    pub fn without_tool(self, tool: &str) -> Self {
        self.state().missing_tools.insert(tool.to_string());
        self
    }

    pub fn with_link(self, iface: &str, state: LinkState) -> Self {
        self.state().links.insert(
            iface.to_string(),
            FakeLink {
                state,
                addresses: Vec::new(),
                ready_after: None,
                polls: 0,
            },
        );
        self
    }

    /// The link reports down until it has been polled `polls` times.
    pub fn link_ready_after(self, iface: &str, polls: u32) -> Self {
        if let Some(link) = self.state().links.get_mut(iface) {
            link.state = LinkState::Down;
            link.ready_after = Some(polls);
        }
        self
    }

    pub fn with_address(self, iface: &str, cidr: &str) -> Self {
        if let Some(link) = self.state().links.get_mut(iface) {
            link.addresses.push(cidr.to_string());
        }
        self
    }

    pub fn with_default_route(self, iface: &str) -> Self {
        self.state().default_route = Some(iface.to_string());
        self
    }

    pub fn unreachable(self) -> Self {
        self.state().reachable = false;
        self
    }

    pub fn with_unit(self, unit: &str, process: &str) -> Self {
        self.state()
            .units
            .insert(unit.to_string(), FakeUnit::new(process));
        self
    }

    /// Mark a unit running, binding its ports.
    pub fn unit_active(self, unit: &str) -> Self {
        {
            let mut state = self.state();
            activate(&mut state, unit);
        }
        self
    }

    pub fn unit_enabled(self, unit: &str) -> Self {
        if let Some(u) = self.state().units.get_mut(unit) {
            u.enabled = true;
        }
        self
    }

    pub fn unit_masked(self, unit: &str) -> Self {
        if let Some(u) = self.state().units.get_mut(unit) {
            u.masked = true;
        }
        self
    }

    pub fn unit_binds(self, unit: &str, protocol: Protocol, port: u16) -> Self {
        if let Some(u) = self.state().units.get_mut(unit) {
            u.ports.push((protocol, port));
        }
        self
    }

    /// The unit's start job succeeds but the daemon exits immediately,
    /// leaving `journal` behind.
    pub fn unit_crashes(self, unit: &str, journal: &[&str]) -> Self {
        if let Some(u) = self.state().units.get_mut(unit) {
            u.fails_to_start = true;
            u.journal.extend(journal.iter().map(|l| l.to_string()));
        }
        self
    }

    pub fn with_sysctl(self, key: &str, value: &str) -> Self {
        self.state()
            .sysctls
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn wifi_blocked(self) -> Self {
        self.state().wifi_blocked = true;
        self
    }

    pub fn rejecting_dnsmasq_config(self, message: &str) -> Self {
        self.state().dnsmasq_rejection = Some(message.to_string());
        self
    }

    // -- runtime mutation ---------------------------------------------------

    /// Simulate a foreign process binding a port.
    pub fn bind(&self, protocol: Protocol, port: u16, process: &str) {
        self.state().listeners.push(Listener {
            protocol,
            address: "0.0.0.0".to_string(),
            port,
            process: Some(process.to_string()),
        });
    }

    /// Release every socket on `protocol`/`port`.
    pub fn release(&self, protocol: Protocol, port: u16) {
        self.state()
            .listeners
            .retain(|l| !(l.protocol == protocol && l.port == port));
    }

    pub fn set_link_state(&self, iface: &str, state: LinkState) {
        if let Some(link) = self.state().links.get_mut(iface) {
            link.state = state;
        }
    }

    // -- inspection ---------------------------------------------------------

    /// Every mutating call, in order, e.g. `"start hostapd"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn link_polls(&self, iface: &str) -> u32 {
        self.state().links.get(iface).map(|l| l.polls).unwrap_or(0)
    }

    pub fn install_requests(&self) -> Vec<Vec<String>> {
        self.state().install_requests.clone()
    }

    pub fn is_unit_active(&self, unit: &str) -> bool {
        self.state().units.get(unit).map(|u| u.active).unwrap_or(false)
    }

    pub fn is_unit_enabled(&self, unit: &str) -> bool {
        self.state().units.get(unit).map(|u| u.enabled).unwrap_or(false)
    }

    pub fn persisted_rules(&self) -> u32 {
        self.state().persisted_rules
    }

    pub fn is_wifi_blocked(&self) -> bool {
        self.state().wifi_blocked
    }

    pub fn regulatory_domain(&self) -> Option<String> {
        self.state().regulatory_domain.clone()
    }
}

fn activate(state: &mut FakeState, unit: &str) -> bool {
    let Some(u) = state.units.get(unit).cloned() else {
        return false;
    };

    let conflict = u.ports.iter().find(|(protocol, port)| {
        state
            .listeners
            .iter()
            .any(|l| l.protocol == *protocol && l.port == *port && !l.is_held_by(&u.process))
    });

    if u.fails_to_start || conflict.is_some() {
        if let Some((protocol, port)) = conflict {
            let line = format!(
                "failed to create listening socket for port {port} ({protocol}): Address already in use"
            );
            if let Some(entry) = state.units.get_mut(unit) {
                entry.journal.push(line);
            }
        }
        if let Some(entry) = state.units.get_mut(unit) {
            entry.active = false;
        }
        return false;
    }

    for (protocol, port) in &u.ports {
        state.listeners.push(Listener {
            protocol: *protocol,
            address: "0.0.0.0".to_string(),
            port: *port,
            process: Some(u.process.clone()),
        });
    }
    if let Some(entry) = state.units.get_mut(unit) {
        entry.active = true;
    }
    true
}

fn deactivate(state: &mut FakeState, unit: &str) {
    let Some(entry) = state.units.get_mut(unit) else {
        return;
    };
    entry.active = false;
    let process = entry.process.clone();
    state.listeners.retain(|l| !l.is_held_by(&process));
}

fn unit_not_found(unit: &str) -> HostError {
    HostError::NotFound {
        kind: "unit",
        name: unit.to_string(),
    }
}

fn missing_tool(tool: &str) -> HostError {
    HostError::Spawn {
        program: tool.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
    }
}

#[async_trait]
impl PackageManager for FakeHost {
    async fn is_available(&self) -> bool {
        self.state().package_manager
    }

    async fn is_installed(&self, package: &str) -> HostResult<bool> {
        Ok(self.state().installed.contains(package))
    }

    async fn install(&self, packages: &[String]) -> HostResult<()> {
        let mut state = self.state();
        if !state.package_manager {
            return Err(missing_tool("apt-get"));
        }
        state.calls.push(format!("install {}", packages.join(" ")));
        state.install_requests.push(packages.to_vec());
        state.installed.extend(packages.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for FakeHost {
    async fn is_active(&self, unit: &str) -> HostResult<bool> {
        Ok(self.state().units.get(unit).map(|u| u.active).unwrap_or(false))
    }

    async fn is_enabled(&self, unit: &str) -> HostResult<bool> {
        Ok(self.state().units.get(unit).map(|u| u.enabled).unwrap_or(false))
    }

    async fn start(&self, unit: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("start {unit}"));
        let u = state.units.get(unit).ok_or_else(|| unit_not_found(unit))?;
        if u.masked {
            return Err(HostError::CommandFailed {
                command: format!("systemctl start {unit}"),
                status: 1,
                stderr: format!("Failed to start {unit}.service: Unit {unit}.service is masked."),
            });
        }
        if !u.active {
            activate(&mut state, unit);
        }
        Ok(())
    }

    async fn stop(&self, unit: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("stop {unit}"));
        if !state.units.contains_key(unit) {
            return Err(unit_not_found(unit));
        }
        deactivate(&mut state, unit);
        Ok(())
    }

    async fn restart(&self, unit: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("restart {unit}"));
        let u = state.units.get(unit).ok_or_else(|| unit_not_found(unit))?;
        if u.masked {
            return Err(HostError::CommandFailed {
                command: format!("systemctl restart {unit}"),
                status: 1,
                stderr: format!("Unit {unit}.service is masked."),
            });
        }
        deactivate(&mut state, unit);
        activate(&mut state, unit);
        Ok(())
    }

    async fn enable(&self, unit: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("enable {unit}"));
        let u = state
            .units
            .get_mut(unit)
            .ok_or_else(|| unit_not_found(unit))?;
        u.enabled = true;
        Ok(())
    }

    async fn unmask(&self, unit: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("unmask {unit}"));
        let u = state
            .units
            .get_mut(unit)
            .ok_or_else(|| unit_not_found(unit))?;
        u.masked = false;
        Ok(())
    }

    async fn journal_tail(&self, unit: &str, lines: usize) -> HostResult<Vec<String>> {
        let state = self.state();
        let u = state.units.get(unit).ok_or_else(|| unit_not_found(unit))?;
        let skip = u.journal.len().saturating_sub(lines);
        Ok(u.journal[skip..].to_vec())
    }
}

#[async_trait]
impl NetworkProbe for FakeHost {
    async fn link_state(&self, iface: &str) -> HostResult<LinkState> {
        let mut state = self.state();
        let Some(link) = state.links.get_mut(iface) else {
            return Ok(LinkState::Missing);
        };
        link.polls += 1;
        if let Some(ready_after) = link.ready_after {
            if link.polls >= ready_after {
                link.state = LinkState::Up;
                link.ready_after = None;
            }
        }
        Ok(link.state)
    }

    async fn ipv4_addresses(&self, iface: &str) -> HostResult<Vec<String>> {
        self.state()
            .links
            .get(iface)
            .map(|l| l.addresses.clone())
            .ok_or_else(|| HostError::NotFound {
                kind: "interface",
                name: iface.to_string(),
            })
    }

    async fn set_link_up(&self, iface: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("set_link_up {iface}"));
        let link = state.links.get_mut(iface).ok_or_else(|| HostError::NotFound {
            kind: "interface",
            name: iface.to_string(),
        })?;
        link.state = LinkState::Up;
        Ok(())
    }

    async fn replace_address(&self, iface: &str, cidr: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("replace_address {iface} {cidr}"));
        let link = state.links.get_mut(iface).ok_or_else(|| HostError::NotFound {
            kind: "interface",
            name: iface.to_string(),
        })?;
        if !link.addresses.iter().any(|a| a == cidr) {
            link.addresses.push(cidr.to_string());
        }
        Ok(())
    }

    async fn default_route_interface(&self) -> HostResult<Option<String>> {
        Ok(self.state().default_route.clone())
    }

    async fn is_reachable(&self, _host: &str) -> HostResult<bool> {
        Ok(self.state().reachable)
    }

    async fn listeners(&self, protocol: Protocol) -> HostResult<Vec<Listener>> {
        Ok(self
            .state()
            .listeners
            .iter()
            .filter(|l| l.protocol == protocol)
            .cloned()
            .collect())
    }

    async fn sysctl(&self, key: &str) -> HostResult<String> {
        self.state()
            .sysctls
            .get(key)
            .cloned()
            .ok_or_else(|| HostError::NotFound {
                kind: "sysctl",
                name: key.to_string(),
            })
    }

    async fn set_sysctl(&self, key: &str, value: &str) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push(format!("set_sysctl {key}={value}"));
        state.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unblock_wifi(&self) -> HostResult<()> {
        let mut state = self.state();
        if state.missing_tools.contains("rfkill") {
            return Err(missing_tool("rfkill"));
        }
        state.calls.push("unblock_wifi".to_string());
        state.wifi_blocked = false;
        Ok(())
    }

    async fn set_regulatory_domain(&self, country: &str) -> HostResult<()> {
        let mut state = self.state();
        if state.missing_tools.contains("iw") {
            return Err(missing_tool("iw"));
        }
        state.calls.push(format!("set_regulatory_domain {country}"));
        state.regulatory_domain = Some(country.to_string());
        Ok(())
    }
}

#[async_trait]
impl Firewall for FakeHost {
    async fn has_masquerade(&self, wan_iface: &str) -> HostResult<bool> {
        Ok(self.state().masquerade.contains(wan_iface))
    }

    async fn load_rules(&self, rules_path: &Path) -> HostResult<()> {
        let rules = std::fs::read_to_string(rules_path)?;
        let mut state = self.state();
        state.calls.push("load_rules".to_string());
        let masquerading: BTreeSet<String> = state
            .links
            .keys()
            .filter(|iface| parse::has_masquerade_rule(&rules, iface))
            .cloned()
            .collect();
        state.masquerade = masquerading;
        Ok(())
    }

    async fn persist_rules(&self) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push("persist_rules".to_string());
        state.persisted_rules += 1;
        Ok(())
    }
}

#[async_trait]
impl DaemonTools for FakeHost {
    async fn check_dnsmasq_config(&self, config_path: &Path) -> HostResult<()> {
        let mut state = self.state();
        state.calls.push("check_dnsmasq_config".to_string());
        let command = format!("dnsmasq --test --conf-file={}", config_path.display());
        if !config_path.exists() {
            return Err(HostError::CommandFailed {
                command,
                status: 3,
                stderr: format!("cannot read {}: No such file or directory", config_path.display()),
            });
        }
        if let Some(message) = state.dnsmasq_rejection.clone() {
            return Err(HostError::CommandFailed {
                command,
                status: 1,
                stderr: message,
            });
        }
        Ok(())
    }
}
