//! Text summary builder for CLI output.
//!
//! Turns a committed operation, or an artifact read back from the cache, into
//! human-readable lines for text mode.

use crate::engine::{Committed, OperationOutput};
use crate::error::ErrorClass;
use crate::model::{
    AnalysisView, CachedArtifact, ColumnSet, ExplorationArtifact, FeatureOutcome, FollowUp,
    InterpretabilityArtifact, ModelArtifact, TreatmentOutcome,
};

/// How many failing row indices to print before eliding the rest.
const ROW_PREVIEW: usize = 10;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(committed: &Committed) -> TextSummary {
    let mut lines = Vec::new();
    match &committed.output {
        OperationOutput::Uploaded { file_name } => lines.push(format!("Uploaded {file_name}")),
        OperationOutput::Columns(cols) => columns(&mut lines, cols),
        OperationOutput::Treated(outcome) => treatment(&mut lines, outcome),
        OperationOutput::Feature(outcome) => feature(&mut lines, outcome),
        OperationOutput::Trained(artifact) => model(&mut lines, artifact),
        OperationOutput::Interpretation(artifact) => interpretation(&mut lines, artifact),
        OperationOutput::Exploration(artifact) => exploration(&mut lines, artifact),
        OperationOutput::Downloaded(bytes) => lines.push(format!("Downloaded {} bytes", bytes.len())),
        OperationOutput::ContextUploaded { files } => lines.push(format!(
            "Uploaded {} context file(s): {}",
            files.len(),
            files.join(", ")
        )),
    }
    TextSummary { lines }
}

pub(crate) fn build_cached_summary(artifact: &CachedArtifact) -> TextSummary {
    let mut lines = Vec::new();
    match artifact {
        CachedArtifact::Analysis(view) => {
            lines.push(format!("Active analysis: {}", view.active().as_str()));
            match view {
                AnalysisView::Train(artifact) => model(&mut lines, artifact),
                AnalysisView::FeatureImportance(artifact) | AnalysisView::OptimalRanges(artifact) => {
                    interpretation(&mut lines, artifact)
                }
            }
        }
        CachedArtifact::Exploration(artifact) => exploration(&mut lines, artifact),
    }
    TextSummary { lines }
}

fn columns(lines: &mut Vec<String>, cols: &ColumnSet) {
    let names = |list: &[crate::model::Column]| {
        list.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
    };
    lines.push(format!("Base columns ({}): {}", cols.base.len(), names(&cols.base)));
    if !cols.derived.is_empty() {
        lines.push(format!(
            "Derived columns ({}): {}",
            cols.derived.len(),
            names(&cols.derived)
        ));
    }
}

fn treatment(lines: &mut Vec<String>, outcome: &TreatmentOutcome) {
    lines.push(outcome.message.clone());
    let FollowUp::ViewDistribution { columns } = &outcome.follow_up;
    lines.push(format!("View the updated distribution of: {}", columns.join(", ")));
}

fn feature(lines: &mut Vec<String>, outcome: &FeatureOutcome) {
    lines.push(format!("New column: {}", outcome.new_column));
    if outcome.is_partial() {
        let shown: Vec<String> = outcome
            .failed_rows
            .iter()
            .take(ROW_PREVIEW)
            .map(usize::to_string)
            .collect();
        let more = outcome.failed_rows.len().saturating_sub(ROW_PREVIEW);
        let tail = if more > 0 { format!(" (+{more} more)") } else { String::new() };
        lines.push(format!(
            "Warning ({}): evaluation failed on {} rows: {}{tail}",
            ErrorClass::PartialData.as_str(),
            outcome.failed_rows.len(),
            shown.join(", ")
        ));
    }
}

fn model(lines: &mut Vec<String>, artifact: &ModelArtifact) {
    for (name, train) in &artifact.metrics_train {
        match artifact.metrics_test.get(name) {
            Some(test) => lines.push(format!("{name:<8} train {train:.4}  test {test:.4}")),
            None => lines.push(format!("{name:<8} train {train:.4}")),
        }
    }
    for (name, test) in &artifact.metrics_test {
        if !artifact.metrics_train.contains_key(name) {
            lines.push(format!("{name:<8} test {test:.4}"));
        }
    }

    if let Some(m) = &artifact.interpretation.model_assessment {
        let fields = [
            ("Fit quality", &m.fit_quality),
            ("Generalization", &m.generalization),
            ("Bias", &m.bias_explanation),
            ("Temporal behavior", &m.temporal_behavior),
            ("Operational readiness", &m.operational_readiness),
        ];
        for (label, value) in fields {
            if let Some(v) = value {
                lines.push(format!("{label}: {v}"));
            }
        }
    }
    if let Some(r) = &artifact.interpretation.risk_assessment {
        if let Some(rec) = &r.deployment_recommendation {
            lines.push(format!("Deployment recommendation: {rec}"));
        }
        if let Some(score) = &r.confidence_score {
            lines.push(format!("Confidence: {score}"));
        }
        if let Some(why) = &r.justification {
            lines.push(format!("Justification: {why}"));
        }
    }
}

fn interpretation(lines: &mut Vec<String>, artifact: &InterpretabilityArtifact) {
    lines.push(format!("{} ready", artifact.kind.label()));
    if let Some(text) = &artifact.interpretation {
        lines.push(text.clone());
    }
    if let Some(rows) = artifact.interpretation_table.as_ref().and_then(|t| t.as_array()) {
        lines.push(format!("Interpretation table: {} rows", rows.len()));
    }
    if !artifact.sources.is_empty() {
        lines.push(format!("Sources: {}", artifact.sources.join(", ")));
    }
}

fn exploration(lines: &mut Vec<String>, artifact: &ExplorationArtifact) {
    let count = |v: &Option<serde_json::Value>| v.as_ref().and_then(|v| v.as_array()).map(Vec::len);
    let mut line = format!("{} plot ready", artifact.kind.as_str());
    if let Some(n) = count(&artifact.ranges) {
        line.push_str(&format!(", {n} ranges"));
    }
    if let Some(n) = count(&artifact.groups) {
        line.push_str(&format!(", {n} groups"));
    }
    lines.push(line);
}
