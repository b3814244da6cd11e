/// requests.rs – Job submission payloads and their client-side business rules.
///
/// Requests that can never succeed are rejected here with
/// `ApiError::Validation` so no round trip is spent on them.
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::api::ApiError;

/// Upper bound on the grid size of one optimization job.
pub const MAX_OPTIMIZATION_COMBINATIONS: u64 = 10_000;

/// Absorbs float error in `(max - min) / step`, so 0..0.3 by 0.1 is 4 points.
const GRID_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize)]
pub struct BacktestRequest {
    pub strategy_id: String,
    pub symbol: String,
    pub interval: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl BacktestRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_common(
            &self.strategy_id,
            &self.symbol,
            self.start_date,
            self.end_date,
            self.initial_capital,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterRange {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    /// Number of grid points between `min` and `max` inclusive, saturating
    /// at `u64::MAX` for degenerate steps.
    pub fn points(&self) -> u64 {
        let steps = ((self.max - self.min) / self.step + GRID_EPSILON).floor();
        if !steps.is_finite() || steps >= u64::MAX as f64 {
            return u64::MAX;
        }
        (steps.max(0.0) as u64).saturating_add(1)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRequest {
    pub strategy_id: String,
    pub symbol: String,
    pub interval: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    /// Objective to maximise, e.g. `sharpe_ratio`.
    pub metric: String,
    pub parameters: Vec<ParameterRange>,
}

impl OptimizationRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_common(
            &self.strategy_id,
            &self.symbol,
            self.start_date,
            self.end_date,
            self.initial_capital,
        )?;
        if self.metric.trim().is_empty() {
            return Err(invalid("an optimization metric is required"));
        }
        if self.parameters.is_empty() {
            return Err(invalid("configure at least one parameter range to optimize"));
        }

        let mut seen = HashSet::new();
        let mut combinations: u64 = 1;
        for p in &self.parameters {
            if p.name.trim().is_empty() {
                return Err(invalid("parameter ranges need a name"));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(invalid(format!("parameter '{}' is configured twice", p.name)));
            }
            if !(p.min.is_finite() && p.max.is_finite() && p.step.is_finite()) {
                return Err(invalid(format!("parameter '{}' has a non-numeric bound", p.name)));
            }
            if p.min > p.max {
                return Err(invalid(format!(
                    "parameter '{}': min ({}) must not exceed max ({})",
                    p.name, p.min, p.max
                )));
            }
            if p.step <= 0.0 {
                return Err(invalid(format!("parameter '{}': step must be > 0", p.name)));
            }
            combinations = combinations.saturating_mul(p.points());
        }
        if combinations > MAX_OPTIMIZATION_COMBINATIONS {
            return Err(invalid(format!(
                "{combinations} parameter combinations exceeds the limit of {MAX_OPTIMIZATION_COMBINATIONS}"
            )));
        }
        Ok(())
    }

    pub fn combinations(&self) -> u64 {
        self.parameters
            .iter()
            .fold(1u64, |acc, p| acc.saturating_mul(p.points()))
    }
}

fn validate_common(
    strategy_id: &str,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
    capital: f64,
) -> Result<(), ApiError> {
    if strategy_id.trim().is_empty() {
        return Err(invalid("select a strategy"));
    }
    if symbol.trim().is_empty() {
        return Err(invalid("select a symbol"));
    }
    if start >= end {
        return Err(invalid("start date must be before end date"));
    }
    if !capital.is_finite() || capital <= 0.0 {
        return Err(invalid("initial capital must be greater than zero"));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError::Validation(msg.into())
}
