//! Transport boundary to the analysis backend.
//!
//! The coordinator only talks to the backend through [`Backend`]; the wire shapes
//! below mirror the JSON the service accepts and returns.

mod http;

pub use http::HttpBackend;

use crate::error::BackendError;
use crate::model::{InterpretabilityKind, Interval, Metrics, ModelInterpretation, TreatmentMethod};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The file last uploaded, kept so a lost session can be re-established.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPayload {
    pub file_name: String,
    pub bytes: Bytes,
}

impl UploadPayload {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset.csv".to_string());
        Ok(Self {
            file_name,
            bytes: Bytes::from(bytes),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TreatmentBody {
    pub columns: Vec<String>,
    pub intervals: Vec<Interval>,
    pub method: TreatmentMethod,
}

/// Operator text boxes as the custom feature endpoint names them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureInputs {
    #[serde(rename = "beforeCol1")]
    pub before_col1: String,
    pub op12: String,
    pub between1and2: String,
    pub op23: String,
    pub between2and3: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomFeatureBody {
    pub column1: String,
    pub column2: String,
    pub column3: String,
    #[serde(rename = "featureInputs")]
    pub feature_inputs: FeatureInputs,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainModelBody {
    pub target: String,
    pub performance_direction: String,
    pub features: Vec<String>,
    pub train_test_option: String,
    pub split_percent: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub model_type: String,
}

/// A prepared exploration request: path, query pairs and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplorationCall {
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnsReply {
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageReply {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomFeatureReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub new_column: Option<String>,
    /// Row indices where the formula could not be evaluated.
    #[serde(default)]
    pub errors: Vec<usize>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainModelReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics_train: Option<Metrics>,
    #[serde(default)]
    pub metrics_test: Option<Metrics>,
    #[serde(default)]
    pub plot_train: Option<serde_json::Value>,
    #[serde(default)]
    pub plot_test: Option<serde_json::Value>,
    #[serde(default)]
    pub plot_train_timeseries: Option<serde_json::Value>,
    #[serde(default)]
    pub plot_test_timeseries: Option<serde_json::Value>,
    #[serde(default)]
    pub model_interpretation: Option<ModelInterpretation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterpretabilityReply {
    #[serde(default)]
    pub plot: Option<serde_json::Value>,
    #[serde(default)]
    pub interpretation: Option<String>,
    #[serde(default)]
    pub interpretation_table: Option<serde_json::Value>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExplorationReply {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub ranges: Option<serde_json::Value>,
    #[serde(default)]
    pub groups: Option<serde_json::Value>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn upload(&self, payload: &UploadPayload) -> Result<(), BackendError>;
    /// Reference documents (SOPs, manuals) the interpretability endpoints cite as sources.
    async fn upload_context(&self, files: &[UploadPayload]) -> Result<(), BackendError>;
    async fn get_columns(&self) -> Result<Vec<String>, BackendError>;
    async fn get_augmented_columns(&self) -> Result<Vec<String>, BackendError>;
    async fn apply_treatment(&self, body: &TreatmentBody) -> Result<String, BackendError>;
    async fn custom_feature(&self, body: &CustomFeatureBody)
        -> Result<CustomFeatureReply, BackendError>;
    async fn train_model(&self, body: &TrainModelBody) -> Result<TrainModelReply, BackendError>;
    async fn interpretability(
        &self,
        kind: InterpretabilityKind,
    ) -> Result<InterpretabilityReply, BackendError>;
    async fn explore(&self, call: &ExplorationCall) -> Result<ExplorationReply, BackendError>;
    async fn download(&self) -> Result<Bytes, BackendError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ErrorCode {
    NoActiveDataset,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<ErrorCode>,
}

/// Map a raw response onto the error taxonomy.
///
/// Session loss is recognised by the structured `code` field regardless of status;
/// any other non-2xx is a status error carrying the body verbatim, and a 2xx body
/// with an `error` field is a rejection.
pub fn classify_response(status: u16, body: &[u8]) -> Result<(), BackendError> {
    let parsed = serde_json::from_slice::<ErrorBody>(body).ok();
    let success = (200..300).contains(&status);

    if let Some(err) = parsed.as_ref() {
        if matches!(err.code, Some(ErrorCode::NoActiveDataset)) {
            return Err(BackendError::NoActiveDataset {
                message: err.error.clone().unwrap_or_else(|| "no data uploaded".into()),
            });
        }
    }

    if !success {
        let message = parsed
            .and_then(|e| e.error)
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
        return Err(BackendError::Status { status, message });
    }

    match parsed.and_then(|e| e.error) {
        Some(message) => Err(BackendError::Rejected { message }),
        None => Ok(()),
    }
}
