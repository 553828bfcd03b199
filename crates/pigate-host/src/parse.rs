//! Parsers for collaborator tool output.
//!
//! Kept free of I/O so the formats can be tested directly against captured
//! output from `ip`, `ss` and `dpkg-query`.

use std::sync::OnceLock;

use regex::Regex;

use crate::traits::{LinkState, Listener, Protocol};

/// Parse `ip -o link show dev <iface>`.
///
/// Empty output means the interface does not exist. An interface counts as up
/// when the kernel reports `state UP`, or when the flags carry both `UP` and
/// `LOWER_UP` (virtual links report `state UNKNOWN`).
pub fn parse_link_state(output: &str) -> LinkState {
    let line = match output.lines().find(|l| !l.trim().is_empty()) {
        Some(line) => line,
        None => return LinkState::Missing,
    };

    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "state" {
            if tokens.next() == Some("UP") {
                return LinkState::Up;
            }
            break;
        }
    }

    let flags = line
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(flags, _)| flags.split(',').collect::<Vec<_>>())
        .unwrap_or_default();

    if flags.contains(&"UP") && flags.contains(&"LOWER_UP") {
        LinkState::Up
    } else {
        LinkState::Down
    }
}

/// Parse `ip -o -4 addr show dev <iface>` into CIDR strings.
pub fn parse_ipv4_addresses(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet")?;
            tokens.next().map(str::to_string)
        })
        .collect()
}

/// Parse `ip -4 route show default` and return the device of the first route.
pub fn parse_default_route(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "dev")?;
            tokens.next().map(str::to_string)
        })
}

fn process_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"users:\(\("([^"]+)""#).expect("static pattern compiles"))
}

/// Parse `ss -H -ln{t,u}p` output.
///
/// Columns are `State Recv-Q Send-Q Local:Port Peer:Port [Process]`. Lines
/// that do not have a numeric local port are skipped.
pub fn parse_ss_listeners(protocol: Protocol, output: &str) -> Vec<Listener> {
    output
        .lines()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let local = columns.get(3)?;
            let (address, port) = local.rsplit_once(':')?;
            let port = port.parse::<u16>().ok()?;
            let process = process_name_re()
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());

            Some(Listener {
                protocol,
                address: address.to_string(),
                port,
                process,
            })
        })
        .collect()
}

/// Parse `dpkg-query -W -f='${Status}' <pkg>`.
pub fn parse_dpkg_status(output: &str) -> bool {
    output.trim() == "install ok installed"
}

/// Whether an `iptables -t nat -S POSTROUTING` listing contains a
/// MASQUERADE rule for traffic leaving `wan_iface`.
pub fn has_masquerade_rule(rules: &str, wan_iface: &str) -> bool {
    rules.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let appends_postrouting = tokens.windows(2).any(|w| w == ["-A", "POSTROUTING"]);
        let leaves_wan = tokens.windows(2).any(|w| w == ["-o", wan_iface]);
        let masquerades = tokens.windows(2).any(|w| w == ["-j", "MASQUERADE"]);
        appends_postrouting && leaves_wan && masquerades
    })
}
