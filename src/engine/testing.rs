//! In-memory backend for coordinator tests, plus typed shortcuts the tests lean on.

use super::{Committed, Coordinator, Operation, OperationOutput};
use crate::backend::{
    Backend, CustomFeatureBody, CustomFeatureReply, ExplorationCall, ExplorationReply,
    InterpretabilityReply, TrainModelBody, TrainModelReply, TreatmentBody, UploadPayload,
};
use crate::error::{BackendError, CoordinatorError};
use crate::model::{
    ColumnSet, ExplorationArtifact, FeatureOutcome, InterpretabilityArtifact, InterpretabilityKind,
    Metrics, ModelArtifact, ModelAssessment, ModelInterpretation, RiskAssessment, TreatmentOutcome,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct State {
    initial: Vec<String>,
    base: Vec<String>,
    derived: Vec<String>,
    uploaded: bool,
    context: Vec<String>,
    calls: HashMap<&'static str, usize>,
    lose_session: HashMap<&'static str, usize>,
    transport: Vec<&'static str>,
    rejections: HashMap<&'static str, String>,
    feature_row_errors: Vec<usize>,
    drop_interpretation: bool,
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<State>>,
    active_mutations: Arc<AtomicUsize>,
    max_mutations: Arc<AtomicUsize>,
}

pub async fn ready_coordinator(backend: &MockBackend) -> Coordinator {
    let coordinator = Coordinator::new(Arc::new(backend.clone()));
    coordinator
        .upload(coordinator.reserve_id(), backend.dataset())
        .await
        .unwrap();
    coordinator
}

impl Coordinator {
    pub async fn submit(&self, op: Operation) -> Result<Committed, CoordinatorError> {
        let id = self.reserve_id();
        self.submit_as(id, op).await
    }

    pub async fn column_set(&self) -> Result<ColumnSet, CoordinatorError> {
        let committed = self.columns(self.reserve_id()).await?;
        Ok(committed.output.into_columns().unwrap())
    }

    pub fn derived_columns(&self) -> Vec<String> {
        self.inner.session.lock().registry.derived_names().to_vec()
    }
}

impl OperationOutput {
    pub fn into_columns(self) -> Option<ColumnSet> {
        match self {
            OperationOutput::Columns(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_treatment(self) -> Option<TreatmentOutcome> {
        match self {
            OperationOutput::Treated(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_feature(self) -> Option<FeatureOutcome> {
        match self {
            OperationOutput::Feature(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_trained(self) -> Option<ModelArtifact> {
        match self {
            OperationOutput::Trained(a) => Some(*a),
            _ => None,
        }
    }

    pub fn into_interpretation(self) -> Option<InterpretabilityArtifact> {
        match self {
            OperationOutput::Interpretation(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_exploration(self) -> Option<ExplorationArtifact> {
        match self {
            OperationOutput::Exploration(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_download(self) -> Option<Bytes> {
        match self {
            OperationOutput::Downloaded(b) => Some(b),
            _ => None,
        }
    }
}

impl MockBackend {
    pub fn new(columns: &[&str]) -> Self {
        let mock = Self::default();
        mock.state().initial = columns.iter().map(|c| c.to_string()).collect();
        mock
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// A CSV with the configured header and one row.
    pub fn dataset(&self) -> UploadPayload {
        let header = self.state().initial.join(",");
        let row = vec!["1"; self.state().initial.len()].join(",");
        UploadPayload {
            file_name: "line3.csv".into(),
            bytes: Bytes::from(format!("{header}\n{row}\n")),
        }
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.state().calls.get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    /// The next `times` calls to `endpoint` report that the dataset is gone.
    pub fn lose_session(&self, endpoint: &'static str, times: usize) {
        self.state().lose_session.insert(endpoint, times);
    }

    pub fn fail_transport(&self, endpoint: &'static str) {
        self.state().transport.push(endpoint);
    }

    pub fn reject(&self, endpoint: &'static str, message: &str) {
        self.state().rejections.insert(endpoint, message.to_string());
    }

    pub fn fail_feature_rows(&self, rows: &[usize]) {
        self.state().feature_row_errors = rows.to_vec();
    }

    pub fn drop_training_interpretation(&self) {
        self.state().drop_interpretation = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn max_concurrent_mutations(&self) -> usize {
        self.max_mutations.load(Ordering::SeqCst)
    }

    async fn enter(&self, endpoint: &'static str, mutating: bool) -> Result<(), BackendError> {
        let delay = {
            let mut s = self.state();
            *s.calls.entry(endpoint).or_default() += 1;
            s.delay
        };
        if mutating {
            let now = self.active_mutations.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_mutations.fetch_max(now, Ordering::SeqCst);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if mutating {
            self.active_mutations.fetch_sub(1, Ordering::SeqCst);
        }

        let mut s = self.state();
        if s.transport.contains(&endpoint) {
            return Err(BackendError::transport("connection refused"));
        }
        if let Some(left) = s.lose_session.get_mut(endpoint).filter(|n| **n > 0) {
            *left -= 1;
            s.uploaded = false;
            return Err(BackendError::NoActiveDataset {
                message: "No data uploaded yet".into(),
            });
        }
        if !matches!(endpoint, "upload" | "upload-context") && !s.uploaded {
            return Err(BackendError::NoActiveDataset {
                message: "No data uploaded yet".into(),
            });
        }
        if let Some(message) = s.rejections.get(endpoint) {
            return Err(BackendError::Rejected {
                message: message.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn upload(&self, payload: &UploadPayload) -> Result<(), BackendError> {
        self.enter("upload", true).await?;
        let text = String::from_utf8_lossy(&payload.bytes);
        let header = text.lines().next().unwrap_or_default();
        let mut s = self.state();
        s.base = header.split(',').map(|c| c.trim().to_string()).collect();
        s.derived.clear();
        s.uploaded = true;
        Ok(())
    }

    async fn upload_context(&self, files: &[UploadPayload]) -> Result<(), BackendError> {
        self.enter("upload-context", false).await?;
        self.state().context.extend(files.iter().map(|f| f.file_name.clone()));
        Ok(())
    }

    async fn get_columns(&self) -> Result<Vec<String>, BackendError> {
        self.enter("get_columns", false).await?;
        Ok(self.state().base.clone())
    }

    async fn get_augmented_columns(&self) -> Result<Vec<String>, BackendError> {
        self.enter("get_augmented_df_columns", false).await?;
        let s = self.state();
        Ok(s.base.iter().chain(s.derived.iter()).cloned().collect())
    }

    async fn apply_treatment(&self, body: &TreatmentBody) -> Result<String, BackendError> {
        self.enter("apply_treatment", true).await?;
        Ok(format!("Treatment '{}' applied to {}", body.method.as_str(), body.columns.join(", ")))
    }

    async fn custom_feature(&self, body: &CustomFeatureBody) -> Result<CustomFeatureReply, BackendError> {
        self.enter("eda/custom_feature", true).await?;
        let mut s = self.state();
        let name = format!("{}_feature_{}", body.column1, s.derived.len() + 1);
        s.derived.push(name.clone());
        Ok(CustomFeatureReply {
            success: true,
            new_column: Some(name),
            errors: s.feature_row_errors.clone(),
            error: None,
        })
    }

    async fn train_model(&self, body: &TrainModelBody) -> Result<TrainModelReply, BackendError> {
        self.enter("train_model", true).await?;
        let metrics: Metrics = [("r2".to_string(), 0.91), ("rmse".to_string(), 1.7)].into();
        let drop_interpretation = self.state().drop_interpretation;
        Ok(TrainModelReply {
            success: true,
            error: None,
            metrics_train: Some(metrics.clone()),
            metrics_test: Some(metrics),
            plot_train: Some(json!({"data": [], "target": body.target})),
            plot_test: Some(json!({"data": []})),
            plot_train_timeseries: Some(json!({"data": []})),
            plot_test_timeseries: Some(json!({"data": []})),
            model_interpretation: (!drop_interpretation).then(|| ModelInterpretation {
                model_assessment: Some(ModelAssessment {
                    fit_quality: Some("Good fit".into()),
                    ..Default::default()
                }),
                risk_assessment: Some(RiskAssessment {
                    deployment_recommendation: Some("Pilot".into()),
                    confidence_score: Some(json!(0.8)),
                    justification: None,
                }),
            }),
        })
    }

    async fn interpretability(&self, kind: InterpretabilityKind) -> Result<InterpretabilityReply, BackendError> {
        self.enter(kind.endpoint(), false).await?;
        Ok(match kind {
            InterpretabilityKind::FeatureImportance => InterpretabilityReply {
                plot: Some(json!({"data": []})),
                interpretation: Some("temp dominates".into()),
                interpretation_table: None,
                sources: self.state().context.clone(),
            },
            InterpretabilityKind::OptimalRanges => InterpretabilityReply {
                plot: Some(json!({"data": []})),
                interpretation: None,
                interpretation_table: Some(json!([{"feature": "temp", "low": 60, "high": 70}])),
                sources: vec![],
            },
        })
    }

    async fn explore(&self, call: &ExplorationCall) -> Result<ExplorationReply, BackendError> {
        self.enter(call.path, false).await?;
        Ok(ExplorationReply {
            kind: "plot".into(),
            data: Some(json!({"data": [], "request": call.body})),
            ranges: None,
            groups: None,
        })
    }

    async fn download(&self) -> Result<Bytes, BackendError> {
        self.enter("download", false).await?;
        let s = self.state();
        let header: Vec<&str> = s.base.iter().chain(s.derived.iter()).map(String::as_str).collect();
        let row = vec!["1"; header.len()].join(",");
        Ok(Bytes::from(format!("{}\n{row}\n", header.join(","))))
    }
}
