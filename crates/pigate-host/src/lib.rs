//! pigate-host: collaborator access for pigate
//!
//! This crate is the only place that knows how the host is driven. The
//! provisioning engine talks to the traits in [`traits`]; the
//! process-backed [`SystemHost`] runs the real tools and
//! [`fakes::FakeHost`] stands in for them in tests.
//!
//! ## Layer 0 - Host
//!
//! Focus: one trait seam per collaborator, tool output parsed in one place.

mod command;
mod error;
pub mod fakes;
pub mod parse;
mod system;
pub mod traits;

pub use command::{run, run_checked, CommandOutput};
pub use error::HostError;
pub use system::SystemHost;
pub use traits::{
    DaemonTools, Firewall, Host, HostResult, LinkState, Listener, NetworkProbe, PackageManager,
    Protocol, ServiceManager,
};
