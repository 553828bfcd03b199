//! Error taxonomy for the provisioning engine.

use std::path::PathBuf;

use pigate_host::{HostError, Protocol};

/// Settings file could not be loaded or failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected KEY=VALUE, got {content:?}")]
    Malformed { line: usize, content: String },

    #[error("missing required settings: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Template could not be loaded, rendered or installed.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("template {template} references undefined settings: {}", keys.join(", "))]
    Unresolved { template: String, keys: Vec<String> },

    #[error("template {template}, line {line}: malformed placeholder")]
    MalformedPlaceholder { template: String, line: usize },

    #[error("{}: {marker:?} has no matching end marker", path.display())]
    UnterminatedBlock { path: PathBuf, marker: String },

    #[error("cannot install {}: {source}", path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by guards, services, stages and the health check.
#[derive(Debug, thiserror::Error)]
pub enum PigateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("port {protocol}/{port} is held by {holder}")]
    PortConflict {
        protocol: Protocol,
        port: u16,
        holder: String,
    },

    #[error("service {service} did not become active: {reason}{}", format_tail(log_tail))]
    ServiceStart {
        service: String,
        reason: String,
        log_tail: Vec<String>,
    },

    #[error("interface {iface} not ready after {attempts} attempt(s)")]
    InterfaceNotReady { iface: String, attempts: u32 },

    #[error("WAN unavailable: {0}")]
    WanUnavailable(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("health check failed: {}", failing.join(", "))]
    HealthCheckFailed { failing: Vec<String> },

    #[error("required directory missing: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("host command failed: {0}")]
    Host(#[from] HostError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PigateError {
    /// Process exit status for this failure class.
    ///
    /// 1 covers validation and generic failures; the other codes let callers
    /// tell failure classes apart without parsing output.
    pub fn exit_code(&self) -> i32 {
        match self {
            PigateError::Config(_)
            | PigateError::Template(_)
            | PigateError::MissingDirectory(_)
            | PigateError::Host(_)
            | PigateError::Io(_) => 1,
            PigateError::PortConflict { .. } => 2,
            PigateError::ServiceStart { .. } => 3,
            PigateError::InterfaceNotReady { .. } => 4,
            PigateError::WanUnavailable(_) => 5,
            PigateError::VerificationFailed(_) | PigateError::HealthCheckFailed { .. } => 6,
        }
    }
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  last log lines:");
    for line in lines {
        out.push_str("\n  | ");
        out.push_str(line);
    }
    out
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PigateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_lists_every_key() {
        let err = ConfigError::MissingKeys(vec!["LAN_IFACE".to_string(), "AP_SSID".to_string()]);
        assert_eq!(err.to_string(), "missing required settings: LAN_IFACE, AP_SSID");
    }

    #[test]
    fn service_start_includes_log_tail() {
        let err = PigateError::ServiceStart {
            service: "hostapd".to_string(),
            reason: "inactive after settle".to_string(),
            log_tail: vec!["nl80211: Could not configure driver mode".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("hostapd"));
        assert!(text.contains("| nl80211: Could not configure driver mode"));
    }

    #[test]
    fn exit_codes_by_class() {
        assert_eq!(
            PigateError::from(ConfigError::MissingKeys(vec![])).exit_code(),
            1
        );
        assert_eq!(
            PigateError::PortConflict {
                protocol: Protocol::Udp,
                port: 53,
                holder: "named".to_string(),
            }
            .exit_code(),
            2
        );
        assert_eq!(
            PigateError::HealthCheckFailed { failing: vec![] }.exit_code(),
            6
        );
        assert_ne!(PigateError::WanUnavailable("down".into()).exit_code(), 0);
    }
}
