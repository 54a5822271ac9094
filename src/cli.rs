use crate::backend::HttpBackend;
use crate::engine::exploration::{CorrelationMethod, DualAxesPlot, ExplorationRequest, MultivariateMode};
use crate::engine::formula::TokenKind;
use crate::engine::Coordinator;
use crate::model::{PerformanceDirection, SessionConfig, SessionEvent};
use crate::orchestrator::{process_completion, run_controller, PanelAction, PanelCommand, TokenSpec};
use crate::text_summary::build_cached_summary;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "copilot-session",
    version,
    about = "Drive an analysis session against the manufacturing copilot backend"
)]
pub struct Cli {
    /// Base URL of the analysis backend
    #[arg(long, global = true, env = "COPILOT_BACKEND_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Dataset (CSV or Excel) uploaded at the start of the session
    #[arg(long, global = true)]
    pub dataset: Option<PathBuf>,

    /// Reference document (SOP, manual, alarm list) uploaded for the assistant to cite; repeatable
    #[arg(long = "context", global = true)]
    pub context: Vec<PathBuf>,

    /// TCP connect timeout for backend requests
    #[arg(long, global = true, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// Print each completed operation as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Where downloaded datasets are saved (default: the user's download directory)
    #[arg(long, global = true)]
    pub download_dir: Option<PathBuf>,

    /// Also write model, interpretability and exploration results as JSON files here
    #[arg(long, global = true)]
    pub export_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug", "copilot_session=trace")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List base and derived columns of the uploaded dataset
    Columns,
    /// Apply a treatment method to columns over one or more intervals
    Treat {
        #[arg(long = "column")]
        columns: Vec<String>,
        /// `start..end`, numeric or RFC 3339 timestamps
        #[arg(long = "interval")]
        intervals: Vec<String>,
        #[arg(long, default_value = "")]
        method: String,
    },
    /// Generate a derived column from up to three operands
    Feature {
        /// Operand columns in slot order
        #[arg(long = "column")]
        columns: Vec<String>,
        /// Function or coefficient applied to a slot, e.g. `1=log` or `2=0.5`
        #[arg(long = "prefix", value_parser = parse_slot_value)]
        prefixes: Vec<(u8, String)>,
        /// Operator joining a slot to the previous one, e.g. `2=/`
        #[arg(long = "op", value_parser = parse_slot_value)]
        operators: Vec<(u8, String)>,
    },
    /// Train a model, optionally followed by interpretability analyses
    Train {
        #[arg(long)]
        target: Option<String>,
        /// maximize or minimize
        #[arg(long)]
        direction: Option<String>,
        #[arg(long = "feature")]
        features: Vec<String>,
        /// random[:PCT], time:PCT or time:[START,END]
        #[arg(long)]
        split: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Request feature importance once the model is trained
        #[arg(long)]
        importance: bool,
        /// Request optimal operating ranges once the model is trained
        #[arg(long)]
        optimal_ranges: bool,
    },
    /// Run an exploratory analysis
    Explore {
        #[command(subcommand)]
        analysis: ExploreCommand,
    },
    /// Download the current (treated and augmented) dataset
    Download,
    /// Run a JSON plan of panel commands
    Script {
        plan: PathBuf,
    },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ExploreCommand {
    /// Box plots of the target per quantile bucket of each column
    Qcut {
        #[arg(long)]
        target: String,
        #[arg(long = "column")]
        columns: Vec<String>,
        #[arg(long, default_value_t = 4)]
        quantiles: u32,
    },
    /// Y distribution over bins of X
    DualAxes {
        #[arg(long)]
        x: String,
        #[arg(long)]
        y: String,
        #[arg(long, value_enum, default_value_t)]
        plot_type: DualAxesPlot,
        #[arg(long, default_value_t = 5)]
        bins: u32,
    },
    Correlation {
        #[arg(long = "column")]
        columns: Vec<String>,
        #[arg(long, value_enum, default_value_t)]
        method: CorrelationMethod,
    },
    /// Stretches where the target stays within a percentile band
    ContinuousRange {
        #[arg(long)]
        target: String,
        #[arg(long)]
        min_duration: Option<f64>,
        #[arg(long)]
        lower_pct: Option<f64>,
        #[arg(long)]
        upper_pct: Option<f64>,
        #[arg(long)]
        max_break: Option<f64>,
    },
    Multivariate {
        #[arg(long, value_enum, default_value_t)]
        mode: MultivariateMode,
        #[arg(long)]
        target: String,
        #[arg(long = "column")]
        columns: Vec<String>,
        #[arg(long, default_value_t = 5)]
        ranges: u32,
        #[arg(long, default_value = "maximize")]
        direction: PerformanceDirection,
    },
    /// Ask the assistant for a variability analysis of one column
    Variability {
        #[arg(long)]
        column: String,
    },
}

impl From<ExploreCommand> for ExplorationRequest {
    fn from(cmd: ExploreCommand) -> Self {
        match cmd {
            ExploreCommand::Qcut {
                target,
                columns,
                quantiles,
            } => ExplorationRequest::QuantileBoxplot {
                target,
                columns,
                quantiles,
            },
            ExploreCommand::DualAxes { x, y, plot_type, bins } => ExplorationRequest::DualAxesBoxplot {
                column_x: x,
                column_y: y,
                plot_type,
                bins,
            },
            ExploreCommand::Correlation { columns, method } => {
                ExplorationRequest::Correlation { columns, method }
            }
            ExploreCommand::ContinuousRange {
                target,
                min_duration,
                lower_pct,
                upper_pct,
                max_break,
            } => ExplorationRequest::ContinuousRange {
                target,
                min_duration,
                lower_pct,
                upper_pct,
                max_break,
            },
            ExploreCommand::Multivariate {
                mode,
                target,
                columns,
                ranges,
                direction,
            } => ExplorationRequest::Multivariate {
                mode,
                target,
                columns,
                ranges,
                direction,
            },
            ExploreCommand::Variability { column } => ExplorationRequest::Variability { column },
        }
    }
}

/// Parse `SLOT=VALUE` for formula tokens.
fn parse_slot_value(s: &str) -> Result<(u8, String), String> {
    let (slot, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SLOT=VALUE, got '{s}'"))?;
    let slot = slot
        .trim()
        .parse::<u8>()
        .map_err(|_| format!("invalid slot '{slot}'"))?;
    Ok((slot, value.trim().to_string()))
}

/// Build a `SessionConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> SessionConfig {
    SessionConfig {
        base_url: args.base_url.clone(),
        user_agent: format!("copilot-session/{}", env!("CARGO_PKG_VERSION")),
        connect_timeout: Duration::from(args.connect_timeout),
        download_dir: args.download_dir.clone(),
    }
}

fn submit(action: PanelAction) -> PanelCommand {
    PanelCommand::Submit { action }
}

/// Translate the subcommand into panel commands: upload, wait, then the requested steps.
pub(crate) fn build_plan(args: &Cli) -> Result<Vec<PanelCommand>> {
    let mut plan = Vec::new();
    if let Some(path) = args.dataset.clone() {
        plan.push(submit(PanelAction::Upload { path }));
        plan.push(PanelCommand::Wait);
    }
    if !args.context.is_empty() {
        plan.push(submit(PanelAction::UploadContext {
            paths: args.context.clone(),
        }));
        plan.push(PanelCommand::Wait);
    }

    let steps = match args.command.clone() {
        Command::Script { plan: path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("read plan {}", path.display()))?;
            let steps: Vec<PanelCommand> = serde_json::from_str(&text)
                .with_context(|| format!("parse plan {}", path.display()))?;
            plan.extend(steps);
            plan.push(PanelCommand::Quit);
            return Ok(plan);
        }
        _ if args.dataset.is_none() => {
            anyhow::bail!("--dataset is required; the backend session starts with an upload")
        }
        Command::Columns => vec![PanelAction::Columns],
        Command::Treat {
            columns,
            intervals,
            method,
        } => vec![PanelAction::Treat {
            columns,
            intervals,
            method,
        }],
        Command::Feature {
            columns,
            prefixes,
            operators,
        } => {
            let tokens = prefixes
                .into_iter()
                .map(|(slot, value)| TokenSpec {
                    slot,
                    kind: TokenKind::Prefix,
                    value,
                })
                .chain(operators.into_iter().map(|(slot, value)| TokenSpec {
                    slot,
                    kind: TokenKind::Infix,
                    value,
                }))
                .collect();
            vec![PanelAction::Feature {
                operands: columns,
                tokens,
            }]
        }
        Command::Train {
            target,
            direction,
            features,
            split,
            model,
            importance,
            optimal_ranges,
        } => {
            let mut steps = vec![PanelAction::Train {
                target,
                direction,
                features,
                split,
                model,
            }];
            if importance {
                steps.push(PanelAction::FeatureImportance);
            }
            if optimal_ranges {
                steps.push(PanelAction::OptimalRanges);
            }
            steps
        }
        Command::Explore { analysis } => vec![PanelAction::Explore(analysis.into())],
        Command::Download => vec![PanelAction::Download],
    };

    for action in steps {
        plan.push(submit(action));
        plan.push(PanelCommand::Wait);
    }
    plan.push(PanelCommand::Quit);
    Ok(plan)
}

pub async fn run(args: Cli) -> Result<()> {
    let plan = build_plan(&args)?;
    let cfg = build_config(&args);
    debug!(?cfg, steps = plan.len(), "starting session");
    let backend = HttpBackend::new(&cfg).context("failed to create backend client")?;
    let coordinator = Coordinator::new(Arc::new(backend));
    run_session(&args, coordinator, plan).await
}

/// Feed the plan to the panel controller and print events until it stops.
async fn run_session(args: &Cli, coordinator: Coordinator, plan: Vec<PanelCommand>) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PanelCommand>();
    for cmd in plan {
        let _ = cmd_tx.send(cmd);
    }
    // Closing the channel also ends the session once the plan runs out.
    drop(cmd_tx);

    let handle = tokio::spawn(run_controller(coordinator, evt_tx, cmd_rx));

    let mut failures = 0usize;
    while let Some(ev) = evt_rx.recv().await {
        match ev {
            SessionEvent::Queued { panel, id, kind } => {
                if !args.json {
                    let _ = out_tx.send(OutputLine::Stderr(format!("== {panel}: {kind} ({id}) ==")));
                }
            }
            SessionEvent::Completed { committed, .. } => {
                let processed = process_completion(args, &committed);
                for line in processed.lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
                for msg in processed.file_messages {
                    let _ = out_tx.send(OutputLine::Stderr(msg));
                }
            }
            SessionEvent::Failed {
                panel,
                id,
                class,
                message,
            } => {
                failures += 1;
                let line = if args.json {
                    serde_json::json!({
                        "panel": panel,
                        "id": id,
                        "class": class,
                        "error": message,
                    })
                    .to_string()
                } else {
                    format!("{panel}: {} error: {message}", class.as_str())
                };
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
            SessionEvent::Cached { panel, artifact } => match artifact {
                None => {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "{panel}: nothing cached for the current dataset"
                    )));
                }
                Some(artifact) if args.json => match serde_json::to_string_pretty(&artifact) {
                    Ok(json) => {
                        let _ = out_tx.send(OutputLine::Stdout(json));
                    }
                    Err(e) => {
                        let _ = out_tx.send(OutputLine::Stderr(format!("Serialize result failed: {e}")));
                    }
                },
                Some(artifact) => {
                    for line in build_cached_summary(&artifact).lines {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                }
            },
            SessionEvent::Dropped { panel, id } => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "{panel}: ignored late response {id}"
                )));
            }
            SessionEvent::Info(info) => {
                let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
            }
        }
    }

    handle
        .await
        .context("session controller task failed")?
        .context("session failed")?;

    drop(out_tx);
    let _ = out_handle.await;

    if failures > 0 {
        anyhow::bail!("{failures} operation(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockBackend;

    fn dataset_file(dir: &tempfile::TempDir, backend: &MockBackend) -> PathBuf {
        let path = dir.path().join("line3.csv");
        std::fs::write(&path, &backend.dataset().bytes).unwrap();
        path
    }

    #[test]
    fn one_shot_commands_upload_first() {
        let args = Cli::parse_from([
            "copilot-session",
            "--dataset",
            "line3.csv",
            "train",
            "--target",
            "yield",
            "--importance",
        ]);
        let plan = build_plan(&args).unwrap();
        let actions: Vec<&str> = plan
            .iter()
            .map(|c| match c {
                PanelCommand::Submit { action: PanelAction::Upload { .. } } => "upload",
                PanelCommand::Submit { action: PanelAction::Train { .. } } => "train",
                PanelCommand::Submit { action: PanelAction::FeatureImportance } => "importance",
                PanelCommand::Wait => "wait",
                PanelCommand::Quit => "quit",
                _ => "other",
            })
            .collect();
        assert_eq!(
            actions,
            ["upload", "wait", "train", "wait", "importance", "wait", "quit"]
        );
    }

    #[test]
    fn one_shot_commands_need_a_dataset() {
        let args = Cli::parse_from(["copilot-session", "columns"]);
        assert!(build_plan(&args).is_err());
    }

    #[test]
    fn formula_tokens_parse_as_slot_pairs() {
        assert_eq!(parse_slot_value("2=/").unwrap(), (2, "/".to_string()));
        assert!(parse_slot_value("log").is_err());
        assert!(parse_slot_value("x=log").is_err());
    }

    #[test]
    fn config_carries_the_connect_timeout() {
        let args = Cli::parse_from(["copilot-session", "--connect-timeout", "3s", "download"]);
        let cfg = build_config(&args);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn session_runs_a_plan_end_to_end() {
        let backend = MockBackend::new(&["temp", "pressure"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dataset_file(&dir, &backend);
        let args = Cli::parse_from([
            "copilot-session",
            "--dataset",
            path.to_str().unwrap(),
            "feature",
            "--column",
            "temp",
            "--column",
            "pressure",
            "--op",
            "2=/",
        ]);
        let plan = build_plan(&args).unwrap();
        let coordinator = Coordinator::new(Arc::new(backend.clone()));

        run_session(&args, coordinator, plan).await.unwrap();
        assert_eq!(backend.calls("upload"), 1);
        assert_eq!(backend.calls("eda/custom_feature"), 1);
    }

    #[tokio::test]
    async fn failed_operations_fail_the_session() {
        let backend = MockBackend::new(&["temp"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dataset_file(&dir, &backend);
        let args = Cli::parse_from([
            "copilot-session",
            "--dataset",
            path.to_str().unwrap(),
            "treat",
            "--column",
            "temp",
        ]);
        let plan = build_plan(&args).unwrap();
        let coordinator = Coordinator::new(Arc::new(backend.clone()));

        let err = run_session(&args, coordinator, plan).await.unwrap_err();
        assert_eq!(err.to_string(), "1 operation(s) failed");
        assert_eq!(backend.calls("apply_treatment"), 0);
    }

    #[test]
    fn context_documents_follow_the_dataset_upload() {
        let args = Cli::parse_from([
            "copilot-session",
            "--dataset",
            "line3.csv",
            "--context",
            "sop.pdf",
            "--context",
            "alarms.txt",
            "explore",
            "variability",
            "--column",
            "temp",
        ]);
        let plan = build_plan(&args).unwrap();
        assert!(matches!(
            &plan[2],
            PanelCommand::Submit { action: PanelAction::UploadContext { paths } } if paths.len() == 2
        ));
        assert!(matches!(plan[3], PanelCommand::Wait));
        assert!(matches!(
            &plan[4],
            PanelCommand::Submit {
                action: PanelAction::Explore(ExplorationRequest::Variability { column })
            } if column == "temp"
        ));
    }

    #[tokio::test]
    async fn scripted_session_shows_cached_results() {
        let backend = MockBackend::new(&["yield", "temp"]);
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset_file(&dir, &backend);
        let sop = dir.path().join("sop.pdf");
        std::fs::write(&sop, b"%PDF-1.4").unwrap();
        let script = dir.path().join("plan.json");
        std::fs::write(
            &script,
            r#"[
                {"step": "submit", "action": {"kind": "train", "target": "yield", "direction": "maximize",
                    "features": ["temp"], "model": "Random Forest"}},
                {"step": "wait"},
                {"step": "submit", "action": {"kind": "feature_importance"}},
                {"step": "wait"},
                {"step": "show_analysis"},
                {"step": "show_exploration", "analysis": "variability"}
            ]"#,
        )
        .unwrap();
        let args = Cli::parse_from([
            "copilot-session",
            "--dataset",
            dataset.to_str().unwrap(),
            "--context",
            sop.to_str().unwrap(),
            "script",
            script.to_str().unwrap(),
        ]);
        let plan = build_plan(&args).unwrap();
        let coordinator = Coordinator::new(Arc::new(backend.clone()));

        run_session(&args, coordinator.clone(), plan).await.unwrap();
        assert_eq!(backend.calls("upload-context"), 1);
        assert_eq!(backend.calls("train_model"), 1);
        let shown = coordinator.cached_analysis().map(|v| v.active());
        assert_eq!(shown, Some(crate::model::ActiveAnalysis::FeatureImportance));
    }
}
