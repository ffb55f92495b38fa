use std::{error::Error, fmt::Debug};

use crate::{
    error_function::ErrorFunction,
    posterior::{Posterior, PosteriorError},
    sed_model::SedModel,
};

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: Error {
    /// Unrecoverable errors during logp computation should stop a sampler,
    /// recoverable errors can be treated as divergences.
    fn is_recoverable(&self) -> bool;
}

/// A log density with gradient over a flat position vector.
///
/// This is the interface gradient-based samplers (NUTS, HMC) and
/// quasi-Newton optimizers consume.
pub trait CpuLogpFunc {
    type LogpError: Debug + Send + Sync + Error + LogpError + 'static;

    fn dim(&self) -> usize;
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

impl LogpError for PosteriorError {
    fn is_recoverable(&self) -> bool {
        matches!(self, PosteriorError::NonFiniteLogp(_))
    }
}

impl<M: SedModel, E: ErrorFunction> CpuLogpFunc for Posterior<M, E> {
    type LogpError = PosteriorError;

    fn dim(&self) -> usize {
        self.input_size()
    }

    /// Uses the configured sign and penalty; the configured mode is ignored.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, PosteriorError> {
        assert!(gradient.len() == position.len());
        let mut graph = self.record_rows(&[position], self.output_settings())?;
        let value = graph.values()[0];
        if !value.is_finite() {
            return Err(PosteriorError::NonFiniteLogp(value));
        }
        gradient.copy_from_slice(&graph.backward(0));
        Ok(value)
    }
}
