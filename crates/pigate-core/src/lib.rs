//! pigate Core Library
//!
//! Settings, templates, guards, service lifecycle and health reporting for
//! provisioning an access point. Everything that touches the host goes
//! through the collaborator traits in `pigate-host`.

pub mod config;
pub mod error;
pub mod fixtures;
pub mod guards;
pub mod health;
pub mod install;
pub mod managed;
pub mod paths;
pub mod retry;
pub mod services;
pub mod telemetry;
pub mod template;

pub use config::{load_settings, parse_env, Ipv4Cidr, Settings, REQUIRED_KEYS, SECRET_KEYS};

pub use error::{ConfigError, PigateError, Result, TemplateError};

pub use guards::{
    ensure_packages, ensure_port_available, interface_exists, interface_up, package_present,
    port_holders, port_in_use, PackageReport, PortStatus,
};

pub use health::{health_report, HealthCheck, HealthReport};

pub use install::{install_file, scratch_file, RenderOutcome};

pub use managed::{remove_managed_block, upsert_managed_block, ManagedBlock};

pub use paths::TargetPaths;

pub use retry::{PollExhausted, RetryPolicy};

pub use services::{ManagedService, ServiceLifecycle};

pub use telemetry::init_tracing;

pub use template::{render, Template, TemplateName, TemplateSet};
