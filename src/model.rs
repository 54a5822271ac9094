use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub base_url: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

/// Monotonic id assigned to every submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upload,
    Discovery,
    Treatment,
    FeatureGeneration,
    ModelTraining,
    Interpretability,
    Exploration,
    Download,
    ContextUpload,
}

impl OperationKind {
    /// Whether operations of this kind change session data (or the session's model state).
    pub fn mutates(self) -> bool {
        matches!(
            self,
            OperationKind::Upload
                | OperationKind::Treatment
                | OperationKind::FeatureGeneration
                | OperationKind::ModelTraining
        )
    }

    /// Context documents live beside the dataset, so they can be sent before one exists.
    pub fn needs_dataset(self) -> bool {
        !matches!(self, OperationKind::Upload | OperationKind::ContextUpload)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Discovery => "discovery",
            OperationKind::Treatment => "treatment",
            OperationKind::FeatureGeneration => "feature_generation",
            OperationKind::ModelTraining => "model_training",
            OperationKind::Interpretability => "interpretability",
            OperationKind::Exploration => "exploration",
            OperationKind::Download => "download",
            OperationKind::ContextUpload => "context_upload",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the remote dataset as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Empty,
    Uploading,
    Ready,
    Mutating,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Base,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub provenance: Provenance,
}

impl Column {
    pub fn base(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provenance: Provenance::Base,
        }
    }

    pub fn derived(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provenance: Provenance::Derived,
        }
    }
}

/// Snapshot of the dataset's columns split by provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSet {
    pub base: Vec<Column>,
    pub derived: Vec<Column>,
}

impl ColumnSet {
    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.base.iter().chain(self.derived.iter())
    }

    /// All column names, base first, in backend order.
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentMethod {
    Mean,
    Median,
    ForwardFill,
    BackwardFill,
    DeleteRows,
}

impl TreatmentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            TreatmentMethod::Mean => "mean",
            TreatmentMethod::Median => "median",
            TreatmentMethod::ForwardFill => "forward_fill",
            TreatmentMethod::BackwardFill => "backward_fill",
            TreatmentMethod::DeleteRows => "delete_rows",
        }
    }
}

impl FromStr for TreatmentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "mean" => Ok(TreatmentMethod::Mean),
            "median" => Ok(TreatmentMethod::Median),
            "forward_fill" | "ffill" => Ok(TreatmentMethod::ForwardFill),
            "backward_fill" | "bfill" => Ok(TreatmentMethod::BackwardFill),
            "delete_rows" | "delete" => Ok(TreatmentMethod::DeleteRows),
            _ => Err(ValidationError::UnknownTreatmentMethod(s.to_string())),
        }
    }
}

/// Half-open range `[start, end)` over either the time index or the column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interval {
    Time {
        #[serde(with = "time::serde::rfc3339")]
        start: time::OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        end: time::OffsetDateTime,
    },
    Value {
        start: f64,
        end: f64,
    },
}

impl Interval {
    pub fn is_empty(&self) -> bool {
        match self {
            Interval::Time { start, end } => start >= end,
            Interval::Value { start, end } => !(start < end),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Time { start, end } => write!(f, "[{start}, {end})"),
            Interval::Value { start, end } => write!(f, "[{start}, {end})"),
        }
    }
}

impl FromStr for Interval {
    type Err = ValidationError;

    /// Parses `start..end`, where both bounds are either numbers or RFC 3339 timestamps.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidInterval(s.to_string());
        let (lo, hi) = s.split_once("..").ok_or_else(invalid)?;
        let (lo, hi) = (lo.trim(), hi.trim());
        if let (Ok(start), Ok(end)) = (lo.parse::<f64>(), hi.parse::<f64>()) {
            return Ok(Interval::Value { start, end });
        }
        let start = parse_timestamp(lo).ok_or_else(invalid)?;
        let end = parse_timestamp(hi).ok_or_else(invalid)?;
        Ok(Interval::Time { start, end })
    }
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<time::OffsetDateTime> {
    use time::format_description::well_known::Rfc3339;
    if let Ok(ts) = time::OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts);
    }
    let date = time::Date::parse(s, time::macros::format_description!("[year]-[month]-[day]")).ok()?;
    Some(date.midnight().assume_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceDirection {
    Maximize,
    Minimize,
}

impl PerformanceDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceDirection::Maximize => "maximize",
            PerformanceDirection::Minimize => "minimize",
        }
    }
}

impl FromStr for PerformanceDirection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maximize" => Ok(PerformanceDirection::Maximize),
            "minimize" => Ok(PerformanceDirection::Minimize),
            _ => Err(ValidationError::MissingDirection),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "Decision Tree")]
    DecisionTree,
    #[serde(rename = "Random Forest")]
    RandomForest,
    #[serde(rename = "XGBoost")]
    XgBoost,
    #[serde(rename = "Light GBM")]
    LightGbm,
}

impl ModelFamily {
    /// Label the backend expects in `modelType`.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::DecisionTree => "Decision Tree",
            ModelFamily::RandomForest => "Random Forest",
            ModelFamily::XgBoost => "XGBoost",
            ModelFamily::LightGbm => "Light GBM",
        }
    }
}

impl FromStr for ModelFamily {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "decisiontree" => Ok(ModelFamily::DecisionTree),
            "randomforest" => Ok(ModelFamily::RandomForest),
            "xgboost" => Ok(ModelFamily::XgBoost),
            "lightgbm" => Ok(ModelFamily::LightGbm),
            _ => Err(ValidationError::UnknownModelFamily(s.to_string())),
        }
    }
}

pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelAssessment {
    #[serde(default)]
    pub fit_quality: Option<String>,
    #[serde(default)]
    pub generalization: Option<String>,
    #[serde(default)]
    pub bias_explanation: Option<String>,
    #[serde(default)]
    pub temporal_behavior: Option<String>,
    #[serde(default)]
    pub operational_readiness: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    #[serde(default)]
    pub deployment_recommendation: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<serde_json::Value>,
    #[serde(default)]
    pub justification: Option<String>,
}

/// Natural-language assessment returned alongside a trained model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInterpretation {
    #[serde(default)]
    pub model_assessment: Option<ModelAssessment>,
    #[serde(default)]
    pub risk_assessment: Option<RiskAssessment>,
}

/// Everything a training run produces. Only ever constructed whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub metrics_train: Metrics,
    pub metrics_test: Metrics,
    pub plot_train: serde_json::Value,
    pub plot_test: serde_json::Value,
    pub plot_train_timeseries: serde_json::Value,
    pub plot_test_timeseries: serde_json::Value,
    pub interpretation: ModelInterpretation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpretabilityKind {
    FeatureImportance,
    OptimalRanges,
}

impl InterpretabilityKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            InterpretabilityKind::FeatureImportance => "feature_importance",
            InterpretabilityKind::OptimalRanges => "optimal_ranges",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            InterpretabilityKind::FeatureImportance => "feature importance",
            InterpretabilityKind::OptimalRanges => "optimal ranges",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretabilityArtifact {
    pub kind: InterpretabilityKind,
    pub plot: serde_json::Value,
    /// Prose explanation (feature importance).
    pub interpretation: Option<String>,
    /// Row table (optimal ranges).
    pub interpretation_table: Option<serde_json::Value>,
    pub sources: Vec<String>,
}

/// Which model analysis is currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveAnalysis {
    Train,
    FeatureImportance,
    OptimalRanges,
}

impl ActiveAnalysis {
    pub fn as_str(self) -> &'static str {
        match self {
            ActiveAnalysis::Train => "train",
            ActiveAnalysis::FeatureImportance => "feature_importance",
            ActiveAnalysis::OptimalRanges => "optimal_ranges",
        }
    }
}

/// The single active model analysis. Holding one variant excludes the others.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "active_analysis", content = "artifact", rename_all = "snake_case")]
pub enum AnalysisView {
    Train(Box<ModelArtifact>),
    FeatureImportance(InterpretabilityArtifact),
    OptimalRanges(InterpretabilityArtifact),
}

impl AnalysisView {
    pub fn active(&self) -> ActiveAnalysis {
        match self {
            AnalysisView::Train(_) => ActiveAnalysis::Train,
            AnalysisView::FeatureImportance(_) => ActiveAnalysis::FeatureImportance,
            AnalysisView::OptimalRanges(_) => ActiveAnalysis::OptimalRanges,
        }
    }

    pub fn from_interpretability(artifact: InterpretabilityArtifact) -> Self {
        match artifact.kind {
            InterpretabilityKind::FeatureImportance => AnalysisView::FeatureImportance(artifact),
            InterpretabilityKind::OptimalRanges => AnalysisView::OptimalRanges(artifact),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationKind {
    QuantileBoxplot,
    DualAxesBoxplot,
    Correlation,
    ContinuousRange,
    Multivariate,
    Variability,
}

impl ExplorationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExplorationKind::QuantileBoxplot => "quantile_boxplot",
            ExplorationKind::DualAxesBoxplot => "dual_axes_boxplot",
            ExplorationKind::Correlation => "correlation",
            ExplorationKind::ContinuousRange => "continuous_range",
            ExplorationKind::Multivariate => "multivariate",
            ExplorationKind::Variability => "variability",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationArtifact {
    pub kind: ExplorationKind,
    pub plot: serde_json::Value,
    #[serde(default)]
    pub ranges: Option<serde_json::Value>,
    #[serde(default)]
    pub groups: Option<serde_json::Value>,
}

/// A cached result read back for display without contacting the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cached", content = "value", rename_all = "snake_case")]
pub enum CachedArtifact {
    Analysis(AnalysisView),
    Exploration(ExplorationArtifact),
}

/// Prompt the UI may show after a treatment commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "follow_up", rename_all = "snake_case")]
pub enum FollowUp {
    ViewDistribution { columns: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreatmentOutcome {
    pub message: String,
    pub follow_up: FollowUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureOutcome {
    pub new_column: String,
    /// Rows the backend could not evaluate; the column is registered regardless.
    pub failed_rows: Vec<usize>,
}

impl FeatureOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_rows.is_empty()
    }
}

/// UI panels that issue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Panel {
    Columns,
    Treatment,
    Features,
    Model,
    Exploration,
    Download,
    Context,
}

impl Panel {
    pub fn as_str(self) -> &'static str {
        match self {
            Panel::Columns => "columns",
            Panel::Treatment => "treatment",
            Panel::Features => "features",
            Panel::Model => "model",
            Panel::Exploration => "exploration",
            Panel::Download => "download",
            Panel::Context => "context",
        }
    }
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Queued {
        panel: Panel,
        id: OperationId,
        kind: OperationKind,
    },
    Completed {
        panel: Panel,
        // Box to keep SessionEvent small; committed outputs carry plots.
        committed: Box<crate::engine::Committed>,
    },
    Failed {
        panel: Panel,
        id: Option<OperationId>,
        class: crate::error::ErrorClass,
        message: String,
    },
    /// What a panel would render from the artifact cache; `None` when nothing fresh is cached.
    Cached {
        panel: Panel,
        artifact: Option<CachedArtifact>,
    },
    /// A response arrived for a panel that is no longer showing it.
    Dropped {
        panel: Panel,
        id: OperationId,
    },
    Info(InfoEvent),
}

/// Structured info events emitted by the orchestrator and consumed by CLI output.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    PanelOpened(Panel),
    PanelClosed(Panel),
    DraftReset(Panel),
}

impl InfoEvent {
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::PanelOpened(panel) => format!("Opened {panel} panel"),
            InfoEvent::PanelClosed(panel) => format!("Closed {panel} panel"),
            InfoEvent::DraftReset(panel) => format!("{panel} form reset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn treatment_method_accepts_aliases_and_rejects_unknown() {
        assert_eq!("ffill".parse::<TreatmentMethod>().unwrap(), TreatmentMethod::ForwardFill);
        assert_eq!("Delete-Rows".parse::<TreatmentMethod>().unwrap(), TreatmentMethod::DeleteRows);
        assert!(matches!(
            "interpolate".parse::<TreatmentMethod>(),
            Err(ValidationError::UnknownTreatmentMethod(m)) if m == "interpolate"
        ));
    }

    #[test]
    fn interval_parses_values_and_dates() {
        assert_eq!(
            "0..12.5".parse::<Interval>().unwrap(),
            Interval::Value { start: 0.0, end: 12.5 }
        );
        let Interval::Time { start, end } = "2024-01-01..2024-01-02T06:00:00Z".parse().unwrap() else {
            panic!("expected a time interval");
        };
        assert!(start < end);
        assert!("10".parse::<Interval>().is_err());
        assert!(Interval::Value { start: 3.0, end: 3.0 }.is_empty());
    }

    #[test]
    fn direction_rejects_unrecognised_words() {
        assert!("higher".parse::<PerformanceDirection>().is_err());
        assert_eq!("MAXIMIZE".parse::<PerformanceDirection>().unwrap(), PerformanceDirection::Maximize);
    }

    #[test]
    fn model_family_round_trips_backend_labels() {
        for family in [
            ModelFamily::DecisionTree,
            ModelFamily::RandomForest,
            ModelFamily::XgBoost,
            ModelFamily::LightGbm,
        ] {
            assert_eq!(family.as_str().parse::<ModelFamily>().unwrap(), family);
        }
        assert_eq!("light-gbm".parse::<ModelFamily>().unwrap(), ModelFamily::LightGbm);
    }
}
