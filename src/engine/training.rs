//! Model training and its read-only follow-ups.

use super::{Committed, Coordinator, Operation};
use crate::backend::{InterpretabilityReply, TrainModelBody, TrainModelReply};
use crate::error::{BackendError, CoordinatorError, ValidationError};
use crate::model::{
    parse_timestamp, InterpretabilityArtifact, InterpretabilityKind, ModelArtifact, ModelFamily,
    OperationId, PerformanceDirection,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const DEFAULT_SPLIT_PERCENT: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOption {
    Random,
    TimePercent,
    TimeCustom,
}

impl SplitOption {
    pub fn as_str(self) -> &'static str {
        match self {
            SplitOption::Random => "random",
            SplitOption::TimePercent => "time_percent",
            SplitOption::TimeCustom => "time_custom",
        }
    }
}

/// Split selection as the form holds it; percent and dates are unchecked.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitDraft {
    pub option: SplitOption,
    pub percent: Option<f64>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl Default for SplitDraft {
    fn default() -> Self {
        Self {
            option: SplitOption::Random,
            percent: Some(DEFAULT_SPLIT_PERCENT),
            start: None,
            end: None,
        }
    }
}

impl FromStr for SplitDraft {
    type Err = ValidationError;

    /// `random`, `random:70`, `time:70` or `time:[start,end]`. Either date may be left empty.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.trim().split_once(':') {
            Some((kind, rest)) => (kind.trim(), Some(rest.trim())),
            None => (s.trim(), None),
        };
        let option = match kind.to_ascii_lowercase().as_str() {
            "random" => SplitOption::Random,
            "time" => SplitOption::TimePercent,
            _ => return Err(ValidationError::UnknownSplit(s.to_string())),
        };
        let Some(rest) = rest else {
            return Ok(SplitDraft {
                option,
                ..SplitDraft::default()
            });
        };

        if let Some(inner) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            if option != SplitOption::TimePercent {
                return Err(ValidationError::UnknownSplit(s.to_string()));
            }
            let (start, end) = inner.split_once(',').unwrap_or((inner, ""));
            let non_empty = |v: &str| {
                let v = v.trim();
                (!v.is_empty()).then(|| v.to_string())
            };
            return Ok(SplitDraft {
                option: SplitOption::TimeCustom,
                percent: None,
                start: non_empty(start),
                end: non_empty(end),
            });
        }

        let percent = rest
            .trim_end_matches('%')
            .parse::<f64>()
            .map_err(|_| ValidationError::InvalidSplitPercent)?;
        Ok(SplitDraft {
            option,
            percent: Some(percent),
            start: None,
            end: None,
        })
    }
}

impl SplitDraft {
    fn validate(&self) -> Result<SplitStrategy, ValidationError> {
        match self.option {
            SplitOption::Random | SplitOption::TimePercent => {
                let percent = self
                    .percent
                    .filter(|p| *p > 0.0 && *p < 100.0)
                    .ok_or(ValidationError::InvalidSplitPercent)?;
                Ok(if self.option == SplitOption::Random {
                    SplitStrategy::Random { percent }
                } else {
                    SplitStrategy::TimePercent { percent }
                })
            }
            SplitOption::TimeCustom => {
                let start = self.start.as_deref().and_then(parse_timestamp);
                let end = self.end.as_deref().and_then(parse_timestamp);
                match (start, end) {
                    (Some(start), Some(end)) if start < end => Ok(SplitStrategy::TimeCustom { start, end }),
                    _ => Err(ValidationError::MissingSplitDates),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "split", rename_all = "snake_case")]
pub enum SplitStrategy {
    Random { percent: f64 },
    TimePercent { percent: f64 },
    TimeCustom {
        #[serde(with = "time::serde::rfc3339")]
        start: OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        end: OffsetDateTime,
    },
}

/// Model form state as entered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRunDraft {
    pub target: Option<String>,
    pub direction: Option<String>,
    pub features: Vec<String>,
    pub split: SplitDraft,
    pub model: Option<String>,
}

impl ModelRunDraft {
    /// First failing check wins; later checks are not evaluated.
    pub fn validate(&self) -> Result<ModelRun, ValidationError> {
        let target = self
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ValidationError::MissingTarget)?;
        let direction: PerformanceDirection = self
            .direction
            .as_deref()
            .ok_or(ValidationError::MissingDirection)?
            .parse()?;
        if self.features.is_empty() {
            return Err(ValidationError::NoFeatures);
        }
        let split = self.split.validate()?;
        let family: ModelFamily = self
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or(ValidationError::MissingModelFamily)?
            .parse()?;
        Ok(ModelRun {
            target: target.to_string(),
            direction,
            features: self.features.clone(),
            split,
            family,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRun {
    pub target: String,
    pub direction: PerformanceDirection,
    pub features: Vec<String>,
    pub split: SplitStrategy,
    pub family: ModelFamily,
}

impl ModelRun {
    pub fn body(&self) -> TrainModelBody {
        let (option, split_percent, start_date, end_date) = match &self.split {
            SplitStrategy::Random { percent } => (SplitOption::Random, Some(*percent), None, None),
            SplitStrategy::TimePercent { percent } => (SplitOption::TimePercent, Some(*percent), None, None),
            SplitStrategy::TimeCustom { start, end } => (
                SplitOption::TimeCustom,
                None,
                start.format(&Rfc3339).ok(),
                end.format(&Rfc3339).ok(),
            ),
        };
        TrainModelBody {
            target: self.target.clone(),
            performance_direction: self.direction.as_str().to_string(),
            features: self.features.clone(),
            train_test_option: option.as_str().to_string(),
            split_percent,
            start_date,
            end_date,
            model_type: self.family.as_str().to_string(),
        }
    }
}

/// All-or-nothing: any missing part means no artifact at all.
pub(crate) fn artifact_from_reply(reply: TrainModelReply) -> Result<ModelArtifact, CoordinatorError> {
    if !reply.success {
        return Err(BackendError::Rejected {
            message: reply.error.unwrap_or_else(|| "Model training failed".to_string()),
        }
        .into());
    }
    let missing = |what: &'static str| CoordinatorError::Incomplete { what };
    Ok(ModelArtifact {
        metrics_train: reply.metrics_train.ok_or_else(|| missing("train metrics"))?,
        metrics_test: reply.metrics_test.ok_or_else(|| missing("test metrics"))?,
        plot_train: reply.plot_train.ok_or_else(|| missing("train plot"))?,
        plot_test: reply.plot_test.ok_or_else(|| missing("test plot"))?,
        plot_train_timeseries: reply
            .plot_train_timeseries
            .ok_or_else(|| missing("train time-series plot"))?,
        plot_test_timeseries: reply
            .plot_test_timeseries
            .ok_or_else(|| missing("test time-series plot"))?,
        interpretation: reply
            .model_interpretation
            .ok_or_else(|| missing("model interpretation"))?,
    })
}

pub(crate) fn interpretability_from_reply(
    kind: InterpretabilityKind,
    reply: InterpretabilityReply,
) -> Result<InterpretabilityArtifact, CoordinatorError> {
    let plot = reply.plot.ok_or(CoordinatorError::Incomplete {
        what: "interpretability plot",
    })?;
    Ok(InterpretabilityArtifact {
        kind,
        plot,
        interpretation: reply.interpretation,
        interpretation_table: reply.interpretation_table,
        sources: reply.sources,
    })
}

#[derive(Clone)]
pub struct ModelRunController {
    coordinator: Coordinator,
    draft: ModelRunDraft,
}

impl ModelRunController {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            draft: ModelRunDraft::default(),
        }
    }

    pub fn draft_mut(&mut self) -> &mut ModelRunDraft {
        &mut self.draft
    }

    pub fn prepare(&self) -> Result<Operation, ValidationError> {
        self.draft.validate().map(Operation::ModelTraining)
    }

    /// Train with the current draft. A success replaces whatever analysis was active.
    pub async fn train(&self, id: OperationId) -> Result<Committed, CoordinatorError> {
        self.coordinator.submit_as(id, self.prepare()?).await
    }

    pub async fn feature_importance(&self, id: OperationId) -> Result<Committed, CoordinatorError> {
        self.follow_up(id, InterpretabilityKind::FeatureImportance).await
    }

    pub async fn optimal_ranges(&self, id: OperationId) -> Result<Committed, CoordinatorError> {
        self.follow_up(id, InterpretabilityKind::OptimalRanges).await
    }

    /// Read-only analysis of the trained model; never re-trains.
    async fn follow_up(&self, id: OperationId, kind: InterpretabilityKind) -> Result<Committed, CoordinatorError> {
        self.coordinator
            .submit_as(id, Operation::Interpretability(kind))
            .await
    }
}
