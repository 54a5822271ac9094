//! Panel command loop.
//!
//! Accepts commands from presentation layers, runs submissions concurrently through the
//! panel controllers and emits events back. Responses for a panel that has since been closed,
//! or superseded by a newer submission from the same panel, are dropped by operation id.

use crate::backend::UploadPayload;
use crate::engine::exploration::ExplorationRequest;
use crate::engine::formula::{FeatureFormulaBuilder, Slot, TokenKind};
use crate::engine::training::{ModelRunController, SplitDraft};
use crate::engine::treatment::TreatmentController;
use crate::engine::{Committed, Coordinator};
use crate::error::{CoordinatorError, ValidationError};
use crate::model::{
    CachedArtifact, ExplorationKind, InfoEvent, Interval, OperationId, OperationKind, Panel,
    SessionEvent,
};
use anyhow::Result;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenSpec {
    pub slot: u8,
    pub kind: TokenKind,
    pub value: String,
}

/// A form submission from one panel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum PanelAction {
    Upload {
        path: PathBuf,
    },
    /// Reference documents the assistant cites; no dataset is needed.
    UploadContext {
        paths: Vec<PathBuf>,
    },
    Columns,
    Treat {
        columns: Vec<String>,
        intervals: Vec<String>,
        #[serde(default)]
        method: String,
    },
    Feature {
        /// Operand columns by slot; an empty string leaves the slot empty.
        operands: Vec<String>,
        #[serde(default)]
        tokens: Vec<TokenSpec>,
    },
    Train {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        direction: Option<String>,
        #[serde(default)]
        features: Vec<String>,
        #[serde(default)]
        split: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    FeatureImportance,
    OptimalRanges,
    Explore(ExplorationRequest),
    Download,
}

impl PanelAction {
    pub fn panel(&self) -> Panel {
        match self {
            PanelAction::Upload { .. } | PanelAction::Columns => Panel::Columns,
            PanelAction::Treat { .. } => Panel::Treatment,
            PanelAction::Feature { .. } => Panel::Features,
            PanelAction::Train { .. } | PanelAction::FeatureImportance | PanelAction::OptimalRanges => {
                Panel::Model
            }
            PanelAction::Explore(_) => Panel::Exploration,
            PanelAction::Download => Panel::Download,
            PanelAction::UploadContext { .. } => Panel::Context,
        }
    }
}

/// Commands emitted by presentation layers (or read from a plan file).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub(crate) enum PanelCommand {
    Open { panel: Panel },
    Close { panel: Panel },
    Submit { action: PanelAction },
    /// Re-read the active model analysis from the cache.
    ShowAnalysis,
    /// Re-read one exploration plot from the cache.
    ShowExploration { analysis: ExplorationKind },
    /// Stop reading commands until every submission has finished.
    Wait,
    Quit,
}

/// Which panels are open and which submission each one is waiting for.
#[derive(Debug, Default)]
struct PanelTracker {
    open: HashSet<Panel>,
    latest: HashMap<Panel, OperationId>,
}

impl PanelTracker {
    fn issue(&mut self, panel: Panel, id: OperationId) {
        self.open.insert(panel);
        self.latest.insert(panel, id);
    }

    fn is_latest(&self, panel: Panel, id: OperationId) -> bool {
        self.latest.get(&panel) == Some(&id)
    }

    /// A response is shown only if its panel is still open and nothing newer was issued there.
    fn accepts(&self, panel: Panel, id: OperationId) -> bool {
        self.open.contains(&panel) && self.is_latest(panel, id)
    }
}

fn read_payload(path: &std::path::Path) -> Result<UploadPayload, CoordinatorError> {
    UploadPayload::read(path).map_err(|e| CoordinatorError::Unreadable {
        message: format!("{e:#}"),
    })
}

/// Form state handed back when its submission finishes.
enum Form {
    Treatment(TreatmentController),
    Formula(FeatureFormulaBuilder),
}

/// A validated submission, carrying a snapshot of the form that produced it.
enum Job {
    Upload(UploadPayload),
    UploadContext(Vec<UploadPayload>),
    Columns,
    Treat(TreatmentController),
    Feature(FeatureFormulaBuilder),
    Train(ModelRunController),
    Importance(ModelRunController),
    OptimalRanges(ModelRunController),
    Explore(ExplorationRequest),
    Download,
}

impl Job {
    fn kind(&self) -> OperationKind {
        match self {
            Job::Upload(_) => OperationKind::Upload,
            Job::UploadContext(_) => OperationKind::ContextUpload,
            Job::Columns => OperationKind::Discovery,
            Job::Treat(_) => OperationKind::Treatment,
            Job::Feature(_) => OperationKind::FeatureGeneration,
            Job::Train(_) => OperationKind::ModelTraining,
            Job::Importance(_) | Job::OptimalRanges(_) => OperationKind::Interpretability,
            Job::Explore(_) => OperationKind::Exploration,
            Job::Download => OperationKind::Download,
        }
    }

    async fn run(
        self,
        coordinator: Coordinator,
        id: OperationId,
    ) -> (Result<Committed, CoordinatorError>, Option<Form>) {
        match self {
            Job::Upload(payload) => (coordinator.upload(id, payload).await, None),
            Job::UploadContext(files) => (coordinator.upload_context(id, files).await, None),
            Job::Columns => (coordinator.columns(id).await, None),
            Job::Treat(mut ctl) => {
                let result = ctl.apply_treatment(id).await;
                (result, Some(Form::Treatment(ctl)))
            }
            Job::Feature(mut builder) => {
                let result = builder.submit(id).await;
                (result, Some(Form::Formula(builder)))
            }
            Job::Train(ctl) => (ctl.train(id).await, None),
            Job::Importance(ctl) => (ctl.feature_importance(id).await, None),
            Job::OptimalRanges(ctl) => (ctl.optimal_ranges(id).await, None),
            Job::Explore(request) => (coordinator.explore(id, request).await, None),
            Job::Download => (coordinator.download(id).await, None),
        }
    }
}

/// Per-panel form state.
struct Panels {
    treatment: TreatmentController,
    formula: FeatureFormulaBuilder,
    model: ModelRunController,
}

impl Panels {
    fn new(coordinator: Coordinator) -> Self {
        Self {
            treatment: TreatmentController::new(coordinator.clone()),
            formula: FeatureFormulaBuilder::new(coordinator.clone()),
            model: ModelRunController::new(coordinator),
        }
    }

    /// Load the action into its panel's form and validate it.
    fn stage(&mut self, action: PanelAction) -> Result<Job, CoordinatorError> {
        let job = match action {
            PanelAction::Upload { path } => Job::Upload(read_payload(&path)?),
            PanelAction::UploadContext { paths } => {
                if paths.is_empty() {
                    return Err(ValidationError::NoContextFiles.into());
                }
                let files = paths
                    .iter()
                    .map(|p| read_payload(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Job::UploadContext(files)
            }
            PanelAction::Columns => Job::Columns,
            PanelAction::Treat {
                columns,
                intervals,
                method,
            } => {
                let draft = self.treatment.draft_mut();
                draft.clear();
                for column in columns {
                    draft.select_column(column);
                }
                for raw in intervals {
                    draft.add_interval(raw.parse::<Interval>()?);
                }
                draft.set_method(method);
                self.treatment.prepare()?;
                Job::Treat(self.treatment.clone())
            }
            PanelAction::Feature { operands, tokens } => {
                self.formula.reset();
                for (slot, column) in Slot::ALL.into_iter().zip(operands.iter()) {
                    self.formula.set_operand(slot, column);
                }
                for token in tokens {
                    let slot = Slot::try_from(token.slot)?;
                    self.formula.set_token(slot, token.kind, &token.value)?;
                }
                self.formula.prepare()?;
                Job::Feature(self.formula.clone())
            }
            PanelAction::Train {
                target,
                direction,
                features,
                split,
                model,
            } => {
                let split = match split {
                    Some(raw) => raw.parse::<SplitDraft>()?,
                    None => SplitDraft::default(),
                };
                let draft = self.model.draft_mut();
                draft.target = target;
                draft.direction = direction;
                draft.features = features;
                draft.split = split;
                draft.model = model;
                self.model.prepare()?;
                Job::Train(self.model.clone())
            }
            PanelAction::FeatureImportance => Job::Importance(self.model.clone()),
            PanelAction::OptimalRanges => Job::OptimalRanges(self.model.clone()),
            PanelAction::Explore(request) => {
                request.validate()?;
                Job::Explore(request)
            }
            PanelAction::Download => Job::Download,
        };
        Ok(job)
    }

    /// Take back a finished form. Returns whether it came back empty.
    fn restore(&mut self, form: Form) -> bool {
        match form {
            Form::Treatment(ctl) => {
                self.treatment = ctl;
                self.treatment.draft().is_empty()
            }
            Form::Formula(builder) => {
                self.formula = builder;
                self.formula.is_empty()
            }
        }
    }
}

type Finished = (Panel, OperationId, Result<Committed, CoordinatorError>, Option<Form>);

fn send_failure(
    event_tx: &UnboundedSender<SessionEvent>,
    panel: Panel,
    id: Option<OperationId>,
    err: &CoordinatorError,
) {
    let _ = event_tx.send(SessionEvent::Failed {
        panel,
        id,
        class: err.class(),
        message: err.to_string(),
    });
}

/// Run panel commands against the coordinator until `Quit` (or the channel closes)
/// and every outstanding submission has finished.
pub(crate) async fn run_controller(
    coordinator: Coordinator,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<PanelCommand>,
) -> Result<()> {
    let mut panels = Panels::new(coordinator.clone());
    let mut tracker = PanelTracker::default();
    let mut tasks: JoinSet<Finished> = JoinSet::new();
    let mut draining = false;
    let mut quit_pending = false;

    loop {
        if draining && tasks.is_empty() {
            if quit_pending {
                break;
            }
            draining = false;
        }

        tokio::select! {
            cmd = cmd_rx.recv(), if !draining => {
                match cmd {
                    Some(PanelCommand::Open { panel }) => {
                        tracker.open.insert(panel);
                        let _ = event_tx.send(SessionEvent::Info(InfoEvent::PanelOpened(panel)));
                    }
                    Some(PanelCommand::Close { panel }) => {
                        // In-flight requests keep running; their responses will be dropped.
                        tracker.open.remove(&panel);
                        let _ = event_tx.send(SessionEvent::Info(InfoEvent::PanelClosed(panel)));
                    }
                    Some(PanelCommand::Submit { action }) => {
                        let panel = action.panel();
                        let job = match panels.stage(action) {
                            Ok(job) => job,
                            Err(err) => {
                                send_failure(&event_tx, panel, None, &err);
                                continue;
                            }
                        };
                        if let Job::Feature(builder) = &job {
                            let _ = event_tx.send(SessionEvent::Info(InfoEvent::Message(format!(
                                "Formula: {}",
                                builder.preview()
                            ))));
                        }
                        let id = coordinator.reserve_id();
                        let kind = job.kind();
                        tracker.issue(panel, id);
                        debug!(op_id = %id, %kind, %panel, "submitted");
                        let _ = event_tx.send(SessionEvent::Queued { panel, id, kind });
                        let c = coordinator.clone();
                        tasks.spawn(async move {
                            let (result, form) = job.run(c, id).await;
                            (panel, id, result, form)
                        });
                    }
                    Some(PanelCommand::ShowAnalysis) => {
                        let _ = event_tx.send(SessionEvent::Cached {
                            panel: Panel::Model,
                            artifact: coordinator.cached_analysis().map(CachedArtifact::Analysis),
                        });
                    }
                    Some(PanelCommand::ShowExploration { analysis }) => {
                        let _ = event_tx.send(SessionEvent::Cached {
                            panel: Panel::Exploration,
                            artifact: coordinator
                                .cached_exploration(analysis)
                                .map(CachedArtifact::Exploration),
                        });
                    }
                    Some(PanelCommand::Wait) => draining = true,
                    Some(PanelCommand::Quit) | None => {
                        quit_pending = true;
                        draining = true;
                        if !tasks.is_empty() {
                            let _ = event_tx.send(SessionEvent::Info(InfoEvent::Message(format!(
                                "Waiting for {} operation(s)…",
                                tasks.len()
                            ))));
                        }
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let (panel, id, result, form) = match joined {
                    Ok(finished) => finished,
                    Err(e) => {
                        let _ = event_tx.send(SessionEvent::Info(InfoEvent::Message(format!(
                            "Operation task failed: {e}"
                        ))));
                        continue;
                    }
                };

                // A newer submission from the same panel owns the form now.
                if let Some(form) = form.filter(|_| tracker.is_latest(panel, id)) {
                    if panels.restore(form) {
                        let _ = event_tx.send(SessionEvent::Info(InfoEvent::DraftReset(panel)));
                    }
                }
                if !tracker.accepts(panel, id) {
                    info!(op_id = %id, %panel, "dropping late response");
                    let _ = event_tx.send(SessionEvent::Dropped { panel, id });
                    continue;
                }
                match result {
                    Ok(committed) => {
                        let _ = event_tx.send(SessionEvent::Completed {
                            panel,
                            committed: Box::new(committed),
                        });
                    }
                    Err(err) => send_failure(&event_tx, panel, Some(id), &err),
                }
            }
        }
    }

    debug!(
        state = ?coordinator.state(),
        last_committed = ?coordinator.last_committed(),
        last_failed = ?coordinator.last_failed(),
        mutations_in_flight = coordinator.mutations_in_flight(),
        "controller stopped"
    );
    Ok(())
}
