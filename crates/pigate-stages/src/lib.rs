//! pigate stages - ordered, idempotent provisioning
//!
//! Provides the stage pipeline that:
//! - Declares the fixed order Prep → WanCheck → LanConfig → ApDhcpConfig →
//!   NatForwarding → HealthCheck → Finalize
//! - Runs each stage as precondition, apply, verify
//! - Stops at the first failing stage and reports its exit code

pub mod builtin;
pub mod pipeline;
pub mod runner;
pub mod stage;

// Re-export key types
pub use builtin::{builtin, PACKAGES};
pub use pipeline::{PipelineResult, StagePipeline};
pub use runner::{StageResult, StageRunner};
pub use stage::{RunOptions, Stage, StageContext, StageName};
