//! pigate - turn a single-board computer into a Wi-Fi router
//!
//! ## Commands
//!
//! - `run`: provision the host, every stage in order
//! - `stage`: run one stage on its own
//! - `health`: print the health report
//! - `check-config`: validate the settings file
//! - `stages`: list the stage order

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pigate_core::{
    health_report, init_tracing, load_settings, PigateError, Settings, TargetPaths, TemplateSet,
};
use pigate_host::SystemHost;
use pigate_stages::{PipelineResult, RunOptions, StageContext, StageName, StagePipeline};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "pigate")]
#[command(author = "pigate contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision a single-board computer as a Wi-Fi router", long_about = None)]
struct Cli {
    /// Settings file (KEY=VALUE lines)
    #[arg(long, env = "PIGATE_ENV", default_value = "/etc/pigate/pigate.env", global = true)]
    env_file: PathBuf,

    /// Directory the managed files are written under
    #[arg(long, env = "PIGATE_ROOT", default_value = "/", global = true)]
    root: PathBuf,

    /// Directory of template overrides
    #[arg(long, env = "PIGATE_TEMPLATES", global = true)]
    templates: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage in order, stopping at the first failure
    Run {
        /// Fail when the uplink is not usable
        #[arg(long)]
        strict_wan: bool,

        /// Seconds to pause between stages
        #[arg(long, default_value = "2")]
        pause_secs: u64,
    },

    /// Run a single stage
    Stage {
        /// Stage name (see `pigate stages`)
        name: StageName,

        /// Fail when the uplink is not usable
        #[arg(long)]
        strict_wan: bool,
    },

    /// Print the health report
    Health {
        #[arg(long, value_enum, default_value = "text")]
        format: ReportFormat,
    },

    /// Load and validate the settings file
    CheckConfig,

    /// List the stages in execution order
    Stages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match dispatch(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("✗ {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Commands::Run {
            strict_wan,
            pause_secs,
        } => {
            let options = RunOptions {
                strict_wan: *strict_wan,
                pause: Duration::from_secs(*pause_secs),
                ..RunOptions::default()
            };
            cmd_run(cli, options).await
        }
        Commands::Stage { name, strict_wan } => {
            let options = RunOptions {
                strict_wan: *strict_wan,
                ..RunOptions::default()
            };
            cmd_stage(cli, *name, options).await
        }
        Commands::Health { format } => cmd_health(&cli.env_file, *format).await,
        Commands::CheckConfig => cmd_check_config(&cli.env_file),
        Commands::Stages => cmd_stages(),
    }
}

/// Map an error to the documented process exit status.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PigateError>()
        .map(exit_status_of)
        .unwrap_or(1)
}

fn settings(env_file: &Path) -> Result<Settings> {
    load_settings(env_file)
        .with_context(|| format!("Failed to load settings from {}", env_file.display()))
}

fn stage_context(cli: &Cli, options: RunOptions) -> Result<StageContext> {
    let settings = settings(&cli.env_file)?;
    let templates = match &cli.templates {
        Some(dir) => TemplateSet::with_overrides(dir),
        None => TemplateSet::builtin(),
    };

    Ok(StageContext::new(
        settings,
        TargetPaths::new(&cli.root),
        Arc::new(SystemHost::new()),
    )
    .with_templates(templates)
    .with_options(options))
}

async fn cmd_run(cli: &Cli, options: RunOptions) -> Result<u8> {
    let ctx = stage_context(cli, options)?;
    info!(root = %cli.root.display(), strict_wan = ctx.options.strict_wan, "Provisioning");

    println!("Provisioning router");
    println!("WAN: {}  LAN: {}", ctx.settings.wan_iface, ctx.settings.lan_iface);
    println!();

    let result = StagePipeline::standard().run(&ctx).await;
    print_summary(&result);
    Ok(exit_status(&result))
}

async fn cmd_stage(cli: &Cli, name: StageName, options: RunOptions) -> Result<u8> {
    let ctx = stage_context(cli, options)?;
    let result = StagePipeline::run_single(name, &ctx).await;
    print_summary(&result);
    Ok(exit_status(&result))
}

async fn cmd_health(env_file: &Path, format: ReportFormat) -> Result<u8> {
    let settings = settings(env_file)?;
    let host = SystemHost::new();
    let report = health_report(&settings, &host).await;

    match format {
        ReportFormat::Text => print!("{}", report.render_text()),
        ReportFormat::Json => println!(
            "{}",
            report.to_json().context("Failed to serialize health report")?
        ),
    }

    if report.ok {
        Ok(0)
    } else {
        Ok(exit_status_of(&PigateError::HealthCheckFailed {
            failing: report.failing_names(),
        }))
    }
}

fn cmd_check_config(env_file: &Path) -> Result<u8> {
    let settings = settings(env_file)?;

    for (key, value) in settings.redacted() {
        println!("{key}={value}");
    }
    println!();
    println!(
        "✓ {} is valid ({} keys)",
        env_file.display(),
        settings.values().len()
    );
    Ok(0)
}

fn cmd_stages() -> Result<u8> {
    for stage in StageName::ALL {
        println!("{}. {}", stage.position(), stage);
    }
    Ok(0)
}

fn print_summary(result: &PipelineResult) {
    println!();
    println!("Run ID: {}", result.run_id);
    println!(
        "Status: {}",
        if result.success { "✓ PASSED" } else { "✗ FAILED" }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for stage in &result.stages {
        let status = if stage.passed() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms, exit code: {})",
            status, stage.stage, stage.duration_ms, stage.exit_code
        );
    }

    println!();
    println!(
        "Summary: {}/{} stages passed",
        result.passed_count(),
        result.stages.len()
    );

    if let Some(e) = &result.failure {
        println!();
        println!("✗ {e}");
    }
}

fn exit_status(result: &PipelineResult) -> u8 {
    u8::try_from(result.exit_code()).unwrap_or(1)
}

fn exit_status_of(err: &PigateError) -> u8 {
    u8::try_from(err.exit_code()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pigate_core::ConfigError;
    use pigate_core::fixtures::SAMPLE_ENV;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "pigate",
            "--root",
            "/tmp/target",
            "run",
            "--strict-wan",
            "--pause-secs",
            "0",
        ])
        .unwrap();

        assert_eq!(cli.root, PathBuf::from("/tmp/target"));
        match cli.command {
            Commands::Run {
                strict_wan,
                pause_secs,
            } => {
                assert!(strict_wan);
                assert_eq!(pause_secs, 0);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_stage_name() {
        let cli = Cli::try_parse_from(["pigate", "stage", "ap-dhcp-config"]).unwrap();
        match cli.command {
            Commands::Stage { name, strict_wan } => {
                assert_eq!(name, StageName::ApDhcpConfig);
                assert!(!strict_wan);
            }
            _ => panic!("expected stage"),
        }

        assert!(Cli::try_parse_from(["pigate", "stage", "reboot"]).is_err());
    }

    #[test]
    fn test_parse_health_format() {
        let cli = Cli::try_parse_from(["pigate", "health", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Health {
                format: ReportFormat::Json
            }
        ));
    }

    #[test]
    fn test_exit_codes_survive_context() {
        let err = anyhow::Error::new(PigateError::PortConflict {
            protocol: pigate_host::Protocol::Udp,
            port: 53,
            holder: "named".to_string(),
        })
        .context("while configuring dnsmasq");
        assert_eq!(exit_code_for(&err), 2);

        let err = anyhow::Error::new(ConfigError::MissingKeys(vec!["WAN_IFACE".to_string()]))
            .context("Failed to load settings");
        assert_eq!(exit_code_for(&err), 1);

        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_check_config_accepts_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pigate.env");
        std::fs::write(&path, SAMPLE_ENV).unwrap();

        assert_eq!(cmd_check_config(&path).unwrap(), 0);
    }

    #[test]
    fn test_check_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_check_config(&dir.path().join("absent.env")).unwrap_err();
        assert_eq!(exit_code_for(&err), 1);
        assert!(err.to_string().contains("absent.env"));
    }
}
