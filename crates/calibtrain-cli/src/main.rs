//! CLI binary for planning and running calibration passes.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use calibtrain_pipeline::{
    validate_registry, CalibrationTrain, MetadataLocation, Severity, StageRole, SwitchMode,
    TrainConfig, DEFAULT_ARTIFACT_FILE, DEFAULT_INPUT, DEFAULT_METADATA, LOCAL_ACCESS_FILE,
    SNAPSHOT_FILE,
};
use calibtrain_types::{CalibError, Overrides};

#[derive(Parser)]
#[command(name = "calibtrain", version, about = "Calibration train: plan and run calibration stages for one run")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute the calibration pass for a run
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Event input, one JSON object per line
        #[arg(short, long, default_value = DEFAULT_INPUT)]
        input: PathBuf,

        /// Directory the artifact is written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Artifact file name
        #[arg(long, default_value = DEFAULT_ARTIFACT_FILE)]
        output_file: String,

        /// Drop per-event auxiliary (friend) data
        #[arg(long)]
        no_friends: bool,
    },

    /// Show the plan and activation decisions for a run without executing it
    Plan {
        #[command(flatten)]
        source: SourceArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the default stage catalogue and its lint diagnostics
    Stages,
}

#[derive(Args)]
struct SourceArgs {
    /// Run number
    run: u32,

    /// Metadata location: local://<dir>, snapshot://<file>, or a directory
    #[arg(short, long, default_value = DEFAULT_METADATA)]
    metadata: String,

    /// Snapshot file used instead of the metadata location when present
    #[arg(long, default_value = SNAPSHOT_FILE)]
    snapshot: PathBuf,

    /// Site file that may redirect metadata access and set switches
    #[arg(long, default_value = LOCAL_ACCESS_FILE)]
    local_access: PathBuf,

    /// Stage switch, e.g. ALIEN_JDL_CPASS0_SDD_CALIBRATION=1 (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, String)>,
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

impl SourceArgs {
    fn into_config(self) -> anyhow::Result<TrainConfig> {
        let metadata: MetadataLocation = self.metadata.parse()?;
        let mut overrides = Overrides::new();
        for (key, value) in self.overrides {
            overrides.set(key, value);
        }
        Ok(TrainConfig {
            metadata,
            snapshot_file: self.snapshot,
            local_access: self.local_access,
            overrides,
            ..TrainConfig::new(self.run)
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let result = match cli.command {
        Commands::Run {
            source,
            input,
            output_dir,
            output_file,
            no_friends,
        } => {
            let config = TrainConfig {
                input,
                output_dir,
                output_file,
                read_friends: !no_friends,
                ..source.into_config()?
            };
            cmd_run(&config).await
        }
        Commands::Plan { source, json } => cmd_plan(&source.into_config()?, json).await,
        Commands::Stages => cmd_stages(),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<CalibError>() {
            Some(calib) if calib.is_run_fatal() => {
                tracing::error!(error = %calib, "Run terminated");
                std::process::exit(1);
            }
            _ => Err(e),
        },
    }
}

async fn cmd_run(config: &TrainConfig) -> anyhow::Result<()> {
    let train = CalibrationTrain::with_default_catalogue()?;
    let handle = train.run(config).await?;
    println!(
        "Run {} complete: {} events, artifact {} (execution {})",
        config.run_id,
        handle.events_processed,
        handle.path.display(),
        handle.execution_id
    );
    Ok(())
}

async fn cmd_plan(config: &TrainConfig, json: bool) -> anyhow::Result<()> {
    let train = CalibrationTrain::with_default_catalogue()?;
    let plan = train.plan_only(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Run {}", plan.run_id);
    if plan.is_empty() {
        println!("Plan: (empty)");
    } else {
        println!("Plan:");
        for (i, stage) in plan.stages.iter().enumerate() {
            let marker = match stage.role {
                StageRole::TerminalMutating => " (terminal)",
                StageRole::Normal => "",
            };
            println!("  {}. {}{}", i + 1, stage.name, marker);
        }
    }

    println!("\nDecisions:");
    for decision in &plan.decisions {
        let state = if decision.activated { "on " } else { "off" };
        println!("  [{}] {}: {}", state, decision.stage, decision.reason);
    }
    Ok(())
}

fn cmd_stages() -> anyhow::Result<()> {
    let train = CalibrationTrain::with_default_catalogue()?;
    let registry = train.registry();

    println!("Stages ({}):", registry.len());
    for stage in registry.iter() {
        let role = match stage.role() {
            StageRole::Normal => "normal",
            StageRole::TerminalMutating => "terminal-mutating",
        };
        let switch = match stage.switch() {
            Some(s) => match s.mode {
                SwitchMode::OptIn => format!(" opt-in {}", s.env),
                SwitchMode::OptOut => format!(" opt-out {}", s.env),
            },
            None => String::new(),
        };
        let needs = if stage.prerequisites().is_empty() {
            String::new()
        } else {
            format!(" needs [{}]", stage.prerequisites().join(", "))
        };
        println!("  {} [{}]{}{}", stage.name(), role, needs, switch);
    }

    let diagnostics = validate_registry(registry);
    if diagnostics.is_empty() {
        println!("\nCatalogue is valid");
        return Ok(());
    }

    println!();
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_override_splits_on_first_equals() {
        assert_eq!(
            parse_override("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_override(" K =").unwrap(), ("K".to_string(), String::new()));
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn cli_parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "calibtrain",
            "run",
            "104892",
            "--metadata",
            "snapshot://snap.json",
            "--set",
            "CALIBTRAIN_DISABLE_TPC=1",
            "--no-friends",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                source, no_friends, input, ..
            } => {
                assert!(no_friends);
                assert_eq!(input, PathBuf::from(DEFAULT_INPUT));
                let config = source.into_config().unwrap();
                assert_eq!(config.run_id, 104892);
                assert_eq!(
                    config.metadata,
                    MetadataLocation::Snapshot(PathBuf::from("snap.json"))
                );
                assert_eq!(config.overrides.switch("CALIBTRAIN_DISABLE_TPC"), Some(1));
            }
            _ => panic!("Expected Run"),
        }
    }

    #[test]
    fn unsupported_metadata_scheme_is_rejected() {
        let cli = Cli::try_parse_from(["calibtrain", "plan", "1", "--metadata", "alien://x"]).unwrap();
        match cli.command {
            Commands::Plan { source, .. } => assert!(source.into_config().is_err()),
            _ => panic!("Expected Plan"),
        }
    }
}
