//! Read-only exploratory analyses. Each kind keeps its own cached plot.

use crate::backend::{ExplorationCall, ExplorationReply};
use crate::error::{BackendError, CoordinatorError, ValidationError};
use crate::model::{ExplorationArtifact, ExplorationKind, PerformanceDirection};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::json;

const UNEXPECTED_REPLY: &str = "Unexpected response from server.";

fn default_quantiles() -> u32 {
    4
}

fn default_bins() -> u32 {
    5
}

fn default_ranges() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMethod {
    #[default]
    Pearson,
    Spearman,
    Kendall,
}

impl CorrelationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrelationMethod::Pearson => "pearson",
            CorrelationMethod::Spearman => "spearman",
            CorrelationMethod::Kendall => "kendall",
        }
    }
}

/// How the X axis of a dual-axes box plot is binned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DualAxesPlot {
    #[default]
    Quantile,
    Auto,
}

impl DualAxesPlot {
    pub fn as_str(self) -> &'static str {
        match self {
            DualAxesPlot::Quantile => "quantile",
            DualAxesPlot::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum MultivariateMode {
    #[default]
    Boxplot,
    Timeseries,
}

impl MultivariateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MultivariateMode::Boxplot => "Boxplot",
            MultivariateMode::Timeseries => "Timeseries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "analysis", rename_all = "snake_case")]
pub enum ExplorationRequest {
    QuantileBoxplot {
        target: String,
        columns: Vec<String>,
        #[serde(default = "default_quantiles")]
        quantiles: u32,
    },
    DualAxesBoxplot {
        column_x: String,
        column_y: String,
        #[serde(default)]
        plot_type: DualAxesPlot,
        #[serde(default = "default_bins")]
        bins: u32,
    },
    Correlation {
        columns: Vec<String>,
        #[serde(default)]
        method: CorrelationMethod,
    },
    ContinuousRange {
        target: String,
        #[serde(default)]
        min_duration: Option<f64>,
        #[serde(default)]
        lower_pct: Option<f64>,
        #[serde(default)]
        upper_pct: Option<f64>,
        #[serde(default)]
        max_break: Option<f64>,
    },
    Multivariate {
        #[serde(default)]
        mode: MultivariateMode,
        target: String,
        columns: Vec<String>,
        #[serde(default = "default_ranges")]
        ranges: u32,
        direction: PerformanceDirection,
    },
    /// Free-form variability study, answered through the chat endpoint.
    Variability {
        column: String,
    },
}

impl ExplorationRequest {
    pub fn kind(&self) -> ExplorationKind {
        match self {
            ExplorationRequest::QuantileBoxplot { .. } => ExplorationKind::QuantileBoxplot,
            ExplorationRequest::DualAxesBoxplot { .. } => ExplorationKind::DualAxesBoxplot,
            ExplorationRequest::Correlation { .. } => ExplorationKind::Correlation,
            ExplorationRequest::ContinuousRange { .. } => ExplorationKind::ContinuousRange,
            ExplorationRequest::Multivariate { .. } => ExplorationKind::Multivariate,
            ExplorationRequest::Variability { .. } => ExplorationKind::Variability,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let blank = |s: &str| s.trim().is_empty();
        match self {
            ExplorationRequest::QuantileBoxplot { target, columns, .. } => {
                if blank(target) || columns.is_empty() {
                    return Err(ValidationError::QuantileSelection);
                }
            }
            ExplorationRequest::DualAxesBoxplot { column_x, column_y, .. } => {
                if blank(column_x) || blank(column_y) {
                    return Err(ValidationError::DualAxesSelection);
                }
            }
            ExplorationRequest::Correlation { columns, .. } => {
                if columns.len() < 2 {
                    return Err(ValidationError::CorrelationSelection);
                }
            }
            ExplorationRequest::ContinuousRange { target, .. } => {
                if blank(target) {
                    return Err(ValidationError::MissingExplorationTarget("continuous range"));
                }
            }
            ExplorationRequest::Multivariate { target, columns, .. } => {
                if blank(target) {
                    return Err(ValidationError::MissingExplorationTarget("multivariate"));
                }
                if columns.is_empty() {
                    return Err(ValidationError::MissingExplorationColumns("multivariate"));
                }
            }
            ExplorationRequest::Variability { column } => {
                if blank(column) {
                    return Err(ValidationError::VariabilitySelection);
                }
            }
        }
        Ok(())
    }

    /// Path, query and body for the backend.
    pub fn call(&self) -> ExplorationCall {
        match self {
            ExplorationRequest::QuantileBoxplot {
                target,
                columns,
                quantiles,
            } => ExplorationCall {
                path: "eda/qcut_boxplot",
                query: vec![("target", target.clone()), ("quantiles", quantiles.to_string())],
                body: json!(columns),
            },
            ExplorationRequest::DualAxesBoxplot {
                column_x,
                column_y,
                plot_type,
                bins,
            } => ExplorationCall {
                path: "eda/dualaxes_boxplot",
                query: Vec::new(),
                body: json!({
                    "column_x": column_x,
                    "column_y": column_y,
                    "plot_type": plot_type.as_str(),
                    "num_bins_quantiles": bins,
                }),
            },
            ExplorationRequest::Correlation { columns, method } => ExplorationCall {
                path: "eda/correlation_analysis",
                query: Vec::new(),
                body: json!({ "columns": columns, "method": method.as_str() }),
            },
            ExplorationRequest::ContinuousRange {
                target,
                min_duration,
                lower_pct,
                upper_pct,
                max_break,
            } => ExplorationCall {
                path: "eda/continuous_range",
                query: Vec::new(),
                body: json!({
                    "target": target,
                    "min_duration": min_duration,
                    "lower_pct": lower_pct,
                    "upper_pct": upper_pct,
                    "max_break": max_break,
                }),
            },
            ExplorationRequest::Multivariate {
                mode,
                target,
                columns,
                ranges,
                direction,
            } => {
                let direction = match direction {
                    PerformanceDirection::Maximize => "higher",
                    PerformanceDirection::Minimize => "lower",
                };
                ExplorationCall {
                    path: "eda/multivariate",
                    query: Vec::new(),
                    body: json!({
                        "mode": mode.as_str(),
                        "target": target,
                        "columns": columns,
                        "numMultiRanges": ranges,
                        "performanceDirection": direction,
                    }),
                }
            }
            ExplorationRequest::Variability { column } => ExplorationCall {
                path: "chat",
                query: Vec::new(),
                body: json!({
                    "prompt": format!("Perform variability analysis where selected variable is {column}"),
                }),
            },
        }
    }
}

/// Only `{type: "plot"}` replies carry a usable artifact.
pub(crate) fn artifact_from_reply(
    kind: ExplorationKind,
    reply: ExplorationReply,
) -> Result<ExplorationArtifact, CoordinatorError> {
    let unexpected = || {
        CoordinatorError::from(BackendError::Rejected {
            message: UNEXPECTED_REPLY.to_string(),
        })
    };
    if reply.kind != "plot" {
        return Err(unexpected());
    }
    Ok(ExplorationArtifact {
        kind,
        plot: reply.data.ok_or_else(unexpected)?,
        ranges: reply.ranges,
        groups: reply.groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{ready_coordinator, MockBackend};

    #[test]
    fn requests_deserialize_with_defaults() {
        let req: ExplorationRequest = serde_json::from_value(json!({
            "analysis": "quantile_boxplot",
            "target": "yield",
            "columns": ["temp"],
        }))
        .unwrap();
        let call = req.call();
        assert_eq!(call.path, "eda/qcut_boxplot");
        assert_eq!(call.query[1], ("quantiles", "4".to_string()));
        assert_eq!(call.body, json!(["temp"]));
    }

    #[test]
    fn validation_messages() {
        let corr = ExplorationRequest::Correlation {
            columns: vec!["temp".into()],
            method: CorrelationMethod::Kendall,
        };
        assert_eq!(corr.validate(), Err(ValidationError::CorrelationSelection));

        let multi = ExplorationRequest::Multivariate {
            mode: MultivariateMode::Timeseries,
            target: "yield".into(),
            columns: vec![],
            ranges: 5,
            direction: PerformanceDirection::Minimize,
        };
        assert_eq!(
            multi.validate().unwrap_err().to_string(),
            "Please select at least one column for multivariate analysis"
        );
    }

    #[test]
    fn multivariate_body_uses_backend_words() {
        let call = ExplorationRequest::Multivariate {
            mode: MultivariateMode::Boxplot,
            target: "yield".into(),
            columns: vec!["temp".into()],
            ranges: 3,
            direction: PerformanceDirection::Minimize,
        }
        .call();
        assert_eq!(call.body["performanceDirection"], "lower");
        assert_eq!(call.body["numMultiRanges"], 3);
    }

    #[test]
    fn non_plot_reply_is_unexpected() {
        let err = artifact_from_reply(
            ExplorationKind::Correlation,
            ExplorationReply {
                kind: "table".into(),
                data: Some(json!([])),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), UNEXPECTED_REPLY);
    }

    #[tokio::test]
    async fn results_are_cached_per_kind_until_the_next_mutation() {
        let backend = MockBackend::new(&["yield", "temp", "pressure"]);
        let coordinator = ready_coordinator(&backend).await;
        let req = ExplorationRequest::Correlation {
            columns: vec!["temp".into(), "pressure".into()],
            method: CorrelationMethod::Spearman,
        };
        let committed = coordinator.explore(coordinator.reserve_id(), req).await.unwrap();
        let artifact = committed.output.into_exploration().unwrap();
        assert_eq!(coordinator.cached_exploration(ExplorationKind::Correlation), Some(artifact));
        assert!(coordinator.cached_exploration(ExplorationKind::QuantileBoxplot).is_none());

        coordinator
            .upload(coordinator.reserve_id(), backend.dataset())
            .await
            .unwrap();
        assert!(coordinator.cached_exploration(ExplorationKind::Correlation).is_none());
    }

    #[tokio::test]
    async fn variability_asks_the_chat_endpoint_about_one_column() {
        let backend = MockBackend::new(&["yield", "temp"]);
        let coordinator = ready_coordinator(&backend).await;

        let blank = ExplorationRequest::Variability { column: "  ".into() };
        let err = coordinator
            .explore(coordinator.reserve_id(), blank)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Please select at least one column for analysis.");
        assert_eq!(backend.calls("chat"), 0);

        let req = ExplorationRequest::Variability { column: "temp".into() };
        let committed = coordinator.explore(coordinator.reserve_id(), req).await.unwrap();
        let artifact = committed.output.into_exploration().unwrap();
        assert_eq!(artifact.kind, ExplorationKind::Variability);
        assert_eq!(
            artifact.plot["request"]["prompt"],
            "Perform variability analysis where selected variable is temp"
        );
        assert_eq!(backend.calls("chat"), 1);
        assert!(coordinator.cached_exploration(ExplorationKind::Variability).is_some());
    }
}
