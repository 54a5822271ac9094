//! Custom feature formulas: up to three operand columns, each with an optional
//! unary prefix, joined by binary operators.
//!
//! An infix operator belongs to the operand it introduces, so slot 1 never has one,
//! and an operand in slot 2 or 3 is only submitted together with its operator.
//! Formulas are evaluated row by row on the backend and may fail on some rows only;
//! the new column is registered regardless.

use super::{Committed, Coordinator, Operation};
use crate::backend::{CustomFeatureBody, CustomFeatureReply, FeatureInputs};
use crate::error::{BackendError, CoordinatorError, ValidationError};
use crate::model::{FeatureOutcome, OperationId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    One,
    Two,
    Three,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::One, Slot::Two, Slot::Three];

    fn index(self) -> usize {
        match self {
            Slot::One => 0,
            Slot::Two => 1,
            Slot::Three => 2,
        }
    }

    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }
}

impl TryFrom<u8> for Slot {
    type Error = ValidationError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Slot::One),
            2 => Ok(Slot::Two),
            3 => Ok(Slot::Three),
            other => Err(ValidationError::InvalidSlot(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Prefix,
    Infix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Log,
    Log10,
    Sqrt,
    Exp,
    Abs,
    Square,
}

impl UnaryFn {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryFn::Log => "log",
            UnaryFn::Log10 => "log10",
            UnaryFn::Sqrt => "sqrt",
            UnaryFn::Exp => "exp",
            UnaryFn::Abs => "abs",
            UnaryFn::Square => "square",
        }
    }
}

/// Applied to a single operand: a named function or a numeric coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryToken {
    Function(UnaryFn),
    Coefficient(f64),
}

impl UnaryToken {
    /// Text sent in the operator box.
    pub fn wire(&self) -> String {
        match self {
            UnaryToken::Function(f) => f.as_str().to_string(),
            UnaryToken::Coefficient(c) => c.to_string(),
        }
    }

    fn apply(&self, operand: &str) -> String {
        match self {
            UnaryToken::Function(f) => format!("{}({operand})", f.as_str()),
            UnaryToken::Coefficient(c) => format!("{c}*{operand}"),
        }
    }
}

impl FromStr for UnaryToken {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Ok(c) = t.parse::<f64>() {
            if c.is_finite() {
                return Ok(UnaryToken::Coefficient(c));
            }
        }
        let f = match t.to_ascii_lowercase().as_str() {
            "log" | "ln" => UnaryFn::Log,
            "log10" => UnaryFn::Log10,
            "sqrt" => UnaryFn::Sqrt,
            "exp" => UnaryFn::Exp,
            "abs" => UnaryFn::Abs,
            "square" | "sq" => UnaryFn::Square,
            _ => return Err(ValidationError::UnknownUnaryToken(s.to_string())),
        };
        Ok(UnaryToken::Function(f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "**",
        }
    }
}

impl FromStr for BinaryOp {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "+" => Ok(BinaryOp::Add),
            "-" => Ok(BinaryOp::Sub),
            "*" | "x" => Ok(BinaryOp::Mul),
            "/" => Ok(BinaryOp::Div),
            "**" | "^" => Ok(BinaryOp::Pow),
            _ => Err(ValidationError::UnknownOperator(s.to_string())),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Operand {
    column: Option<String>,
    prefix: Option<UnaryToken>,
    infix: Option<BinaryOp>,
}

impl Operand {
    fn has_tokens(&self) -> bool {
        self.prefix.is_some() || self.infix.is_some()
    }

    fn render(&self, column: &str) -> String {
        match &self.prefix {
            Some(token) => token.apply(column),
            None => column.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    column: String,
    prefix: Option<UnaryToken>,
    /// `None` only for the first term.
    infix: Option<BinaryOp>,
}

/// A validated formula, compacted so that present operands are contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFormula {
    terms: Vec<Term>,
}

impl FeatureFormula {
    pub fn columns(&self) -> Vec<&str> {
        self.terms.iter().map(|t| t.column.as_str()).collect()
    }

    pub fn body(&self) -> CustomFeatureBody {
        let column = |i: usize| self.terms.get(i).map(|t| t.column.clone()).unwrap_or_default();
        let prefix = |i: usize| {
            self.terms
                .get(i)
                .and_then(|t| t.prefix.as_ref())
                .map(UnaryToken::wire)
                .unwrap_or_default()
        };
        let infix = |i: usize| {
            self.terms
                .get(i)
                .and_then(|t| t.infix)
                .map(|op| op.as_str().to_string())
                .unwrap_or_default()
        };
        CustomFeatureBody {
            column1: column(0),
            column2: column(1),
            column3: column(2),
            feature_inputs: FeatureInputs {
                before_col1: prefix(0),
                op12: prefix(1),
                between1and2: infix(1),
                op23: prefix(2),
                between2and3: infix(2),
            },
        }
    }
}

/// Formula draft edited one selection at a time, then submitted whole.
#[derive(Clone)]
pub struct FeatureFormulaBuilder {
    coordinator: Coordinator,
    slots: [Operand; 3],
}

impl FeatureFormulaBuilder {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            slots: Default::default(),
        }
    }

    /// An empty `column` clears the slot's operand.
    pub fn set_operand(&mut self, slot: Slot, column: &str) {
        let column = column.trim();
        self.slots[slot.index()].column = (!column.is_empty()).then(|| column.to_string());
    }

    /// An empty `value` clears the token.
    pub fn set_token(&mut self, slot: Slot, kind: TokenKind, value: &str) -> Result<(), ValidationError> {
        let operand = &mut self.slots[slot.index()];
        let clear = value.trim().is_empty();
        match kind {
            TokenKind::Prefix => {
                operand.prefix = if clear { None } else { Some(value.parse()?) };
            }
            TokenKind::Infix if slot == Slot::One => {
                if !clear {
                    return Err(ValidationError::InfixOnFirstColumn);
                }
            }
            TokenKind::Infix => {
                operand.infix = if clear { None } else { Some(value.parse()?) };
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.slots = Default::default();
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|o| o.column.is_none() && !o.has_tokens())
    }

    /// Left-to-right rendering of whatever is set. Empty operands contribute nothing.
    pub fn preview(&self) -> String {
        let mut parts = Vec::new();
        for (i, operand) in self.slots.iter().enumerate() {
            let Some(column) = operand.column.as_deref() else {
                continue;
            };
            if i > 0 && !parts.is_empty() {
                if let Some(op) = operand.infix {
                    parts.push(op.to_string());
                }
            }
            parts.push(operand.render(column));
        }
        parts.join(" ")
    }

    pub fn formula(&self) -> Result<FeatureFormula, ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyFormula);
        }
        let first = &self.slots[0];
        let Some(column) = first.column.clone() else {
            return Err(ValidationError::MissingFirstOperand);
        };
        let mut terms = vec![Term {
            column,
            prefix: first.prefix,
            infix: None,
        }];
        for slot in [Slot::Two, Slot::Three] {
            let operand = &self.slots[slot.index()];
            match (&operand.column, operand.infix) {
                (None, _) if operand.has_tokens() => {
                    return Err(ValidationError::DanglingToken(slot.number()))
                }
                (None, _) => {}
                (Some(_), None) => return Err(ValidationError::MissingOperator(slot.number())),
                (Some(column), Some(op)) => terms.push(Term {
                    column: column.clone(),
                    prefix: operand.prefix,
                    infix: Some(op),
                }),
            }
        }
        Ok(FeatureFormula { terms })
    }

    pub fn prepare(&self) -> Result<Operation, ValidationError> {
        self.formula().map(Operation::FeatureGeneration)
    }

    /// Submit the formula as operation `id`. The draft is discarded after any terminal
    /// response from the backend; a formula rejected locally is kept.
    pub async fn submit(&mut self, id: OperationId) -> Result<Committed, CoordinatorError> {
        let op = self.prepare()?;
        let result = self.coordinator.submit_as(id, op).await;
        self.reset();
        result
    }
}

/// A reply naming the new column commits, whatever rows failed.
pub(crate) fn outcome_from_reply(reply: CustomFeatureReply) -> Result<FeatureOutcome, CoordinatorError> {
    match reply.new_column.filter(|c| !c.is_empty()) {
        Some(new_column) => {
            let mut failed_rows = reply.errors;
            failed_rows.sort_unstable();
            failed_rows.dedup();
            Ok(FeatureOutcome {
                new_column,
                failed_rows,
            })
        }
        None if reply.success => Err(CoordinatorError::Incomplete { what: "feature column" }),
        None => Err(BackendError::Rejected {
            message: reply
                .error
                .unwrap_or_else(|| "Feature generation failed".to_string()),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{ready_coordinator, MockBackend};
    use crate::model::Provenance;

    async fn builder() -> (MockBackend, FeatureFormulaBuilder) {
        let backend = MockBackend::new(&["temp", "pressure", "flow"]);
        let coordinator = ready_coordinator(&backend).await;
        (backend, FeatureFormulaBuilder::new(coordinator))
    }

    fn next_id(b: &FeatureFormulaBuilder) -> OperationId {
        b.coordinator.reserve_id()
    }

    #[tokio::test]
    async fn single_operand_previews_as_its_name() {
        let (_, mut b) = builder().await;
        b.set_operand(Slot::One, "temp");
        assert_eq!(b.preview(), "temp");
    }

    #[tokio::test]
    async fn preview_concatenates_left_to_right() {
        let (_, mut b) = builder().await;
        b.set_operand(Slot::One, "temp");
        b.set_token(Slot::One, TokenKind::Prefix, "log").unwrap();
        b.set_operand(Slot::Two, "pressure");
        b.set_token(Slot::Two, TokenKind::Infix, "/").unwrap();
        b.set_token(Slot::Two, TokenKind::Prefix, "2").unwrap();
        assert_eq!(b.preview(), "log(temp) / 2*pressure");

        b.set_operand(Slot::Two, "");
        b.set_operand(Slot::Three, "flow");
        b.set_token(Slot::Three, TokenKind::Infix, "^").unwrap();
        assert_eq!(b.preview(), "log(temp) ** flow");
    }

    #[tokio::test]
    async fn tokens_are_parsed_at_the_boundary() {
        let (_, mut b) = builder().await;
        assert_eq!(
            b.set_token(Slot::One, TokenKind::Prefix, "cosh"),
            Err(ValidationError::UnknownUnaryToken("cosh".into()))
        );
        assert_eq!(
            b.set_token(Slot::Two, TokenKind::Infix, "%"),
            Err(ValidationError::UnknownOperator("%".into()))
        );
        assert_eq!(
            b.set_token(Slot::One, TokenKind::Infix, "+"),
            Err(ValidationError::InfixOnFirstColumn)
        );
        assert_eq!(Slot::try_from(4), Err(ValidationError::InvalidSlot(4)));
    }

    #[tokio::test]
    async fn validation_order() {
        let (_, mut b) = builder().await;
        assert_eq!(b.formula(), Err(ValidationError::EmptyFormula));

        b.set_operand(Slot::Two, "pressure");
        assert_eq!(b.formula(), Err(ValidationError::MissingFirstOperand));

        b.set_operand(Slot::One, "temp");
        assert_eq!(b.formula(), Err(ValidationError::MissingOperator(2)));

        b.set_token(Slot::Two, TokenKind::Infix, "-").unwrap();
        b.set_token(Slot::Three, TokenKind::Prefix, "sqrt").unwrap();
        assert_eq!(b.formula(), Err(ValidationError::DanglingToken(3)));
    }

    #[tokio::test]
    async fn third_operand_is_compacted_into_second_position() {
        let (_, mut b) = builder().await;
        b.set_operand(Slot::One, "temp");
        b.set_operand(Slot::Three, "flow");
        b.set_token(Slot::Three, TokenKind::Infix, "*").unwrap();
        b.set_token(Slot::Three, TokenKind::Prefix, "abs").unwrap();
        let body = b.formula().unwrap().body();
        assert_eq!(body.column2, "flow");
        assert_eq!(body.column3, "");
        assert_eq!(body.feature_inputs.between1and2, "*");
        assert_eq!(body.feature_inputs.op12, "abs");
        assert_eq!(body.feature_inputs.between2and3, "");
    }

    #[tokio::test]
    async fn nothing_set_makes_no_backend_call() {
        let (backend, mut b) = builder().await;
        let before = backend.total_calls();
        let err = b.submit(next_id(&b)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(ValidationError::EmptyFormula)));
        assert_eq!(backend.total_calls(), before);
    }

    #[tokio::test]
    async fn operand_without_operator_is_kept_for_correction() {
        let (backend, mut b) = builder().await;
        b.set_operand(Slot::One, "temp");
        b.set_operand(Slot::Two, "pressure");
        let err = b.submit(next_id(&b)).await.unwrap_err();
        assert_eq!(err.to_string(), "Please enter an operator before Column 2.");
        assert_eq!(backend.calls("eda/custom_feature"), 0);
        assert_eq!(b.preview(), "temp pressure");
    }

    #[tokio::test]
    async fn partial_failure_still_registers_the_column() {
        let (backend, mut b) = builder().await;
        backend.fail_feature_rows(&[7, 42, 99]);
        b.set_operand(Slot::One, "temp");
        b.set_operand(Slot::Two, "pressure");
        b.set_token(Slot::Two, TokenKind::Infix, "/").unwrap();

        let committed = b.submit(next_id(&b)).await.unwrap();
        let outcome = committed.output.into_feature().unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.failed_rows, vec![7, 42, 99]);
        assert!(b.is_empty());

        let cols = b.coordinator.column_set().await.unwrap();
        let derived = cols.iter().find(|c| c.name == outcome.new_column).unwrap();
        assert_eq!(derived.provenance, Provenance::Derived);
    }

    #[test]
    fn reply_without_column_is_rejected_with_backend_text() {
        let err = outcome_from_reply(CustomFeatureReply {
            success: false,
            error: Some("Column 'x' not numeric".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Column 'x' not numeric");

        let err = outcome_from_reply(CustomFeatureReply {
            success: true,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::Incomplete { .. }));
    }
}
