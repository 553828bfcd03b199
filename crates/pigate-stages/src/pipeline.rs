//! Fail-fast stage pipeline.

use std::time::Instant;

use pigate_core::PigateError;
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::builtin::builtin;
use crate::runner::{StageResult, StageRunner};
use crate::stage::{Stage, StageContext, StageName};

/// Result of a pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    /// Correlates every log line of this run.
    pub run_id: String,

    /// Whether every executed stage passed.
    pub success: bool,

    /// Results of the stages that ran, in order.
    pub stages: Vec<StageResult>,

    /// The error that stopped the run.
    pub failure: Option<PigateError>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }

    /// The stage that stopped the run.
    pub fn failed_stage(&self) -> Option<StageName> {
        self.stages.iter().find(|s| !s.passed()).map(|s| s.stage)
    }

    /// Process exit status for the whole run.
    pub fn exit_code(&self) -> i32 {
        self.failure.as_ref().map(PigateError::exit_code).unwrap_or(0)
    }
}

/// An ordered list of stages run one at a time.
pub struct StagePipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl StagePipeline {
    /// The declared provisioning order.
    pub fn standard() -> Self {
        Self::new(StageName::ALL.into_iter().map(builtin).collect())
    }

    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// Pauses for `ctx.options.pause` between consecutive stages.
    pub async fn run(&self, ctx: &StageContext) -> PipelineResult {
        run_stages(self.stages.iter().map(|s| s.as_ref()).collect(), ctx).await
    }

    /// Run one stage on its own.
    pub async fn run_single(name: StageName, ctx: &StageContext) -> PipelineResult {
        let stage = builtin(name);
        run_stages(vec![stage.as_ref()], ctx).await
    }
}

async fn run_stages(stages: Vec<&dyn Stage>, ctx: &StageContext) -> PipelineResult {
    let start = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("run", run_id = %run_id);

    async move {
        info!(
            run_id = %run_id,
            stages = ?stages.iter().map(|s| s.name().name()).collect::<Vec<_>>(),
            "Starting provisioning run"
        );

        let mut results = Vec::new();
        let mut failure = None;

        for (idx, stage) in stages.iter().enumerate() {
            if idx > 0 && !ctx.options.pause.is_zero() {
                tokio::time::sleep(ctx.options.pause).await;
            }

            let (result, error) = StageRunner::execute_stage(*stage, ctx).await;
            results.push(result);
            if let Some(e) = error {
                failure = Some(e);
                break;
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let success = failure.is_none();

        if success {
            info!(run_id = %run_id, duration_ms, "Provisioning run completed successfully");
        } else {
            info!(run_id = %run_id, duration_ms, "Provisioning run failed");
        }

        PipelineResult {
            run_id,
            success,
            stages: results,
            failure,
            duration_ms,
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stage: StageName, exit_code: i32) -> StageResult {
        StageResult {
            stage,
            exit_code,
            error: (exit_code != 0).then(|| "boom".to_string()),
            duration_ms: 100,
            success: exit_code == 0,
        }
    }

    #[test]
    fn test_pipeline_result_counts() {
        let result = PipelineResult {
            run_id: "run123".to_string(),
            success: true,
            stages: vec![result(StageName::Prep, 0), result(StageName::WanCheck, 0)],
            failure: None,
            duration_ms: 300,
        };

        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.failed_count(), 0);
        assert_eq!(result.exit_code(), 0);
        assert!(result.failed_stage().is_none());
    }

    #[test]
    fn test_pipeline_result_with_failures() {
        let result = PipelineResult {
            run_id: "run123".to_string(),
            success: false,
            stages: vec![result(StageName::Prep, 0), result(StageName::WanCheck, 5)],
            failure: Some(PigateError::WanUnavailable("no route".to_string())),
            duration_ms: 300,
        };

        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.failed_stage(), Some(StageName::WanCheck));
        assert_eq!(result.exit_code(), 5);
    }

    #[test]
    fn test_standard_order() {
        assert_eq!(StagePipeline::standard().names(), StageName::ALL.to_vec());
    }
}
