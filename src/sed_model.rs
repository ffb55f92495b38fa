//! The forward SED model seen from the posterior.
//!
//! How photometry is synthesised (stellar populations, dust radiative
//! transfer, filter integration) lives behind [`SedModel`]. The posterior
//! only needs parameter bookkeeping, a differentiable forward pass for one
//! parameter row, and a way to snapshot and restore the adapter (input side)
//! and detector (output side) configuration.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::tape::{Tape, Var};

/// Flat configuration mapping of one collaborator.
pub type ModelConfig = BTreeMap<String, serde_json::Value>;

/// Forward model output for a single parameter row.
#[derive(Debug, Clone)]
pub struct Forward {
    /// Predicted photometry, one node per observed band.
    pub photometry: Vec<Var>,
    /// Whether any model parameter lies outside the model's valid domain.
    pub is_out: bool,
}

/// A parametric SED forward model together with its detector.
pub trait SedModel {
    /// Number of physical parameters.
    fn input_size(&self) -> usize;

    /// Names of the physical parameters, `input_size()` of them.
    fn param_names(&self) -> Vec<String>;

    /// `(lower, upper)` per physical parameter, in `param_names` order.
    fn bounds(&self) -> Vec<(f64, f64)>;

    /// Record the forward pass of one parameter row on `tape`.
    ///
    /// `params` has exactly `input_size()` entries. If `check_bounds` is
    /// false the returned `is_out` must be false.
    fn forward(&self, tape: &mut Tape, params: &[Var], check_bounds: bool) -> Result<Forward>;

    /// Configuration of the parameter adapter.
    fn input_config(&self) -> ModelConfig;

    /// Configuration of the detector.
    fn output_config(&self) -> ModelConfig;

    /// Apply adapter options as produced by `input_config`.
    ///
    /// Unknown keys or values of the wrong type must be reported as errors.
    fn configure_input_mode(&mut self, config: &ModelConfig) -> Result<()>;

    /// Apply detector options as produced by `output_config`.
    ///
    /// Unknown keys or values of the wrong type must be reported as errors.
    fn configure_output_mode(&mut self, config: &ModelConfig) -> Result<()>;
}

impl<M: SedModel + ?Sized> SedModel for Box<M> {
    fn input_size(&self) -> usize {
        (**self).input_size()
    }

    fn param_names(&self) -> Vec<String> {
        (**self).param_names()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        (**self).bounds()
    }

    fn forward(&self, tape: &mut Tape, params: &[Var], check_bounds: bool) -> Result<Forward> {
        (**self).forward(tape, params, check_bounds)
    }

    fn input_config(&self) -> ModelConfig {
        (**self).input_config()
    }

    fn output_config(&self) -> ModelConfig {
        (**self).output_config()
    }

    fn configure_input_mode(&mut self, config: &ModelConfig) -> Result<()> {
        (**self).configure_input_mode(config)
    }

    fn configure_output_mode(&mut self, config: &ModelConfig) -> Result<()> {
        (**self).configure_output_mode(config)
    }
}

/// Whether any value lies at or beyond its `(lower, upper)` bound.
pub(crate) fn beyond_bounds(values: impl IntoIterator<Item = f64>, bounds: &[(f64, f64)]) -> bool {
    values
        .into_iter()
        .zip(bounds)
        .any(|(val, &(lower, upper))| val <= lower || val >= upper)
}
