//! Objective and evaluation plug-ins
//!
//! An [`ObjFunc`] supplies the link transform and the per-row
//! (gradient, hessian) pair the boosting loop fits trees to; an
//! [`EvalFunc`] folds weighted `(label, prediction)` pairs into a
//! scalar metric. Both are resolved by name so persisted models can
//! rebind their objective on load.

use crate::errors::{GbmError, Result};
use std::sync::Arc;

/// Differentiable training objective.
pub trait ObjFunc: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of raw outputs per instance (1 for regression / binary).
    fn num_outputs(&self) -> usize {
        1
    }

    /// Link transform from raw scores to prediction space.
    fn transform(&self, raw: &[f64], out: &mut [f64]);

    /// Inverse link, used to map a base score into raw space.
    fn inverse_transform(&self, pred: &[f64], out: &mut [f64]);

    /// Write interleaved `(grad, hess)` pairs for one instance.
    fn compute(&self, label: &[f64], raw: &[f64], grad_hess: &mut [f64]);
}

/// Squared-error loss for regression.
#[derive(Debug, Default)]
pub struct SquareLoss;

impl ObjFunc for SquareLoss {
    fn name(&self) -> &'static str {
        "square"
    }

    fn transform(&self, raw: &[f64], out: &mut [f64]) {
        out.copy_from_slice(raw);
    }

    fn inverse_transform(&self, pred: &[f64], out: &mut [f64]) {
        out.copy_from_slice(pred);
    }

    fn compute(&self, label: &[f64], raw: &[f64], grad_hess: &mut [f64]) {
        for k in 0..raw.len() {
            grad_hess[2 * k] = raw[k] - label[k];
            grad_hess[2 * k + 1] = 1.0;
        }
    }
}

/// Logistic loss for binary classification; labels in {0, 1}.
#[derive(Debug, Default)]
pub struct LogisticLoss;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl ObjFunc for LogisticLoss {
    fn name(&self) -> &'static str {
        "logistic"
    }

    fn transform(&self, raw: &[f64], out: &mut [f64]) {
        for (o, &r) in out.iter_mut().zip(raw.iter()) {
            *o = sigmoid(r);
        }
    }

    fn inverse_transform(&self, pred: &[f64], out: &mut [f64]) {
        for (o, &p) in out.iter_mut().zip(pred.iter()) {
            let p = p.clamp(1e-15, 1.0 - 1e-15);
            *o = (p / (1.0 - p)).ln();
        }
    }

    fn compute(&self, label: &[f64], raw: &[f64], grad_hess: &mut [f64]) {
        for k in 0..raw.len() {
            let p = sigmoid(raw[k]);
            grad_hess[2 * k] = p - label[k];
            grad_hess[2 * k + 1] = (p * (1.0 - p)).max(1e-15);
        }
    }
}

/// Resolve an objective by its persisted name.
pub fn objective_by_name(name: &str) -> Result<Arc<dyn ObjFunc>> {
    match name {
        "square" => Ok(Arc::new(SquareLoss)),
        "logistic" => Ok(Arc::new(LogisticLoss)),
        other => Err(GbmError::InvalidModel(format!(
            "unknown objective `{other}`"
        ))),
    }
}

/// Weighted streaming metric over `(label, prediction)` pairs.
pub trait EvalFunc: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_larger_better(&self) -> bool {
        false
    }

    /// Weighted contribution of one instance: `(value, weight)`.
    fn accumulate(&self, weight: f64, label: &[f64], pred: &[f64]) -> (f64, f64);

    /// Fold the accumulated sums into the final metric value.
    fn finalize(&self, sum: f64, weight_sum: f64) -> f64;
}

/// Root-mean-squared error.
#[derive(Debug, Default)]
pub struct RmseEval;

impl EvalFunc for RmseEval {
    fn name(&self) -> &'static str {
        "rmse"
    }

    fn accumulate(&self, weight: f64, label: &[f64], pred: &[f64]) -> (f64, f64) {
        let se: f64 = label
            .iter()
            .zip(pred.iter())
            .map(|(&l, &p)| (p - l) * (p - l))
            .sum();
        (weight * se, weight)
    }

    fn finalize(&self, sum: f64, weight_sum: f64) -> f64 {
        if weight_sum > 0.0 {
            (sum / weight_sum).sqrt()
        } else {
            0.0
        }
    }
}

/// Mean absolute error.
#[derive(Debug, Default)]
pub struct MaeEval;

impl EvalFunc for MaeEval {
    fn name(&self) -> &'static str {
        "mae"
    }

    fn accumulate(&self, weight: f64, label: &[f64], pred: &[f64]) -> (f64, f64) {
        let ae: f64 = label
            .iter()
            .zip(pred.iter())
            .map(|(&l, &p)| (p - l).abs())
            .sum();
        (weight * ae, weight)
    }

    fn finalize(&self, sum: f64, weight_sum: f64) -> f64 {
        if weight_sum > 0.0 {
            sum / weight_sum
        } else {
            0.0
        }
    }
}

/// Negative log-likelihood of binary predictions in (0, 1).
#[derive(Debug, Default)]
pub struct LogLossEval;

impl EvalFunc for LogLossEval {
    fn name(&self) -> &'static str {
        "logloss"
    }

    fn accumulate(&self, weight: f64, label: &[f64], pred: &[f64]) -> (f64, f64) {
        let p = pred[0].clamp(1e-15, 1.0 - 1e-15);
        let ll = -(label[0] * p.ln() + (1.0 - label[0]) * (1.0 - p).ln());
        (weight * ll, weight)
    }

    fn finalize(&self, sum: f64, weight_sum: f64) -> f64 {
        if weight_sum > 0.0 {
            sum / weight_sum
        } else {
            0.0
        }
    }
}

/// Binary classification error at the 0.5 threshold.
#[derive(Debug, Default)]
pub struct ErrorEval;

impl EvalFunc for ErrorEval {
    fn name(&self) -> &'static str {
        "error"
    }

    fn accumulate(&self, weight: f64, label: &[f64], pred: &[f64]) -> (f64, f64) {
        let wrong = (pred[0] >= 0.5) != (label[0] >= 0.5);
        (if wrong { weight } else { 0.0 }, weight)
    }

    fn finalize(&self, sum: f64, weight_sum: f64) -> f64 {
        if weight_sum > 0.0 {
            sum / weight_sum
        } else {
            0.0
        }
    }
}

/// Resolve an evaluation function by name.
pub fn eval_by_name(name: &str) -> Result<Arc<dyn EvalFunc>> {
    match name {
        "rmse" => Ok(Arc::new(RmseEval)),
        "mae" => Ok(Arc::new(MaeEval)),
        "logloss" => Ok(Arc::new(LogLossEval)),
        "error" => Ok(Arc::new(ErrorEval)),
        other => Err(GbmError::InvalidParameter {
            name: "evaluation",
            constraint: "one of rmse, mae, logloss, error",
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_loss_gradient() {
        let obj = SquareLoss;
        let mut gh = [0.0; 2];
        obj.compute(&[3.0], &[5.0], &mut gh);
        assert_eq!(gh, [2.0, 1.0]);
    }

    #[test]
    fn test_logistic_round_trip() {
        let obj = LogisticLoss;
        let mut pred = [0.0];
        let mut raw = [0.0];
        obj.transform(&[1.7], &mut pred);
        obj.inverse_transform(&pred, &mut raw);
        assert!((raw[0] - 1.7).abs() < 1e-9);
    }

    #[test]
    fn test_logistic_gradient_at_zero() {
        let obj = LogisticLoss;
        let mut gh = [0.0; 2];
        obj.compute(&[1.0], &[0.0], &mut gh);
        assert!((gh[0] - (-0.5)).abs() < 1e-12);
        assert!((gh[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_rmse() {
        let eval = RmseEval;
        let (s1, w1) = eval.accumulate(1.0, &[1.0], &[3.0]);
        let (s2, w2) = eval.accumulate(1.0, &[0.0], &[0.0]);
        assert_eq!(eval.finalize(s1 + s2, w1 + w2), (4.0f64 / 2.0).sqrt());
    }

    #[test]
    fn test_error_metric() {
        let eval = ErrorEval;
        let (s, w) = eval.accumulate(2.0, &[1.0], &[0.2]);
        assert_eq!((s, w), (2.0, 2.0));
        let (s, w) = eval.accumulate(2.0, &[1.0], &[0.9]);
        assert_eq!((s, w), (0.0, 2.0));
    }

    #[test]
    fn test_lookup_by_name() {
        assert!(objective_by_name("square").is_ok());
        assert!(objective_by_name("huber").is_err());
        assert!(eval_by_name("rmse").is_ok());
        assert!(eval_by_name("auc").is_err());
    }
}
