//! Single-stage execution: precondition, apply, verify.

use std::time::Instant;

use pigate_core::PigateError;
use serde::Serialize;

use crate::stage::{Stage, StageContext, StageName};

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Stage name.
    pub stage: StageName,

    /// Exit code the stage maps to (0 = success).
    pub exit_code: i32,

    /// Error message, if the stage failed.
    pub error: Option<String>,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StageResult {
    /// Whether this stage passed.
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Runs one stage and prints its banners.
pub struct StageRunner;

impl StageRunner {
    /// Execute `stage` and return its result plus the error that stopped it.
    pub async fn execute_stage(
        stage: &dyn Stage,
        ctx: &StageContext,
    ) -> (StageResult, Option<PigateError>) {
        let name = stage.name();
        let start = Instant::now();

        println!(
            "==> [{}/{}] {name}: starting",
            name.position(),
            StageName::ALL.len()
        );
        tracing::info!(stage = %name, "Executing stage");

        let outcome = async {
            stage.precondition(ctx).await?;
            stage.apply(ctx).await?;
            stage.verify(ctx).await
        }
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                println!("<== {name}: done ({duration_ms} ms)");
                tracing::info!(stage = %name, duration_ms, "Stage completed");
                (
                    StageResult {
                        stage: name,
                        exit_code: 0,
                        error: None,
                        duration_ms,
                        success: true,
                    },
                    None,
                )
            }
            Err(e) => {
                let exit_code = e.exit_code();
                println!("<== {name}: FAILED (exit {exit_code}): {e}");
                tracing::error!(stage = %name, exit_code, error = %e, "Stage failed");
                (
                    StageResult {
                        stage: name,
                        exit_code,
                        error: Some(e.to_string()),
                        duration_ms,
                        success: false,
                    },
                    Some(e),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult {
            stage: StageName::Prep,
            exit_code: 0,
            error: None,
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_stage_result_failed() {
        let result = StageResult {
            stage: StageName::ApDhcpConfig,
            exit_code: 3,
            error: Some("service hostapd did not become active".to_string()),
            duration_ms: 100,
            success: false,
        };
        assert!(!result.passed());
    }
}
