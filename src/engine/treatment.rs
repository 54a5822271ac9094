//! Missing-value and outlier treatment.

use super::{Committed, Coordinator, Operation};
use crate::backend::TreatmentBody;
use crate::error::{CoordinatorError, ValidationError};
use crate::model::{Interval, OperationId, TreatmentMethod};
use serde::Serialize;

/// What the treatment form currently holds. Method is kept as typed until submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreatmentDraft {
    columns: Vec<String>,
    intervals: Vec<Interval>,
    method: Option<String>,
}

impl TreatmentDraft {
    pub fn select_column(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.columns.contains(&name) {
            self.columns.push(name);
        }
    }

    pub fn add_interval(&mut self, interval: Interval) {
        if !self.intervals.contains(&interval) {
            self.intervals.push(interval);
        }
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        let method = method.into();
        self.method = (!method.trim().is_empty()).then_some(method);
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.intervals.is_empty()
    }

    /// Back to the empty form. The chosen method is a preference and survives.
    pub fn clear(&mut self) {
        self.columns.clear();
        self.intervals.clear();
    }

    /// Checks run in order; the first failure is returned.
    pub fn request(&self) -> Result<TreatmentRequest, ValidationError> {
        if self.columns.is_empty() {
            return Err(ValidationError::NoTreatmentColumns);
        }
        if self.intervals.is_empty() {
            return Err(ValidationError::NoTreatmentIntervals);
        }
        if let Some(bad) = self.intervals.iter().find(|i| i.is_empty()) {
            return Err(ValidationError::EmptyInterval(bad.to_string()));
        }
        let method = self
            .method
            .as_deref()
            .ok_or(ValidationError::MissingTreatmentMethod)?
            .parse::<TreatmentMethod>()?;
        Ok(TreatmentRequest {
            columns: self.columns.clone(),
            intervals: self.intervals.clone(),
            method,
        })
    }
}

/// A validated treatment. Applied atomically by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentRequest {
    pub columns: Vec<String>,
    pub intervals: Vec<Interval>,
    pub method: TreatmentMethod,
}

impl TreatmentRequest {
    pub fn body(&self) -> TreatmentBody {
        TreatmentBody {
            columns: self.columns.clone(),
            intervals: self.intervals.clone(),
            method: self.method,
        }
    }
}

#[derive(Clone)]
pub struct TreatmentController {
    coordinator: Coordinator,
    draft: TreatmentDraft,
}

impl TreatmentController {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            draft: TreatmentDraft::default(),
        }
    }

    pub fn draft(&self) -> &TreatmentDraft {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut TreatmentDraft {
        &mut self.draft
    }

    pub fn prepare(&self) -> Result<Operation, ValidationError> {
        self.draft.request().map(Operation::Treatment)
    }

    /// Submit the form as operation `id`. A committed treatment empties the form;
    /// a failed one leaves it for correction.
    pub async fn apply_treatment(&mut self, id: OperationId) -> Result<Committed, CoordinatorError> {
        let op = self.prepare()?;
        let result = self.coordinator.submit_as(id, op).await;
        if result.is_ok() {
            self.draft.clear();
        }
        result
    }
}
