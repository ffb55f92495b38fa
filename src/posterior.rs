use std::{fmt, str::FromStr};

use faer::MatRef;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error_function::{ErrorFunction, ErrorKernel},
    sed_model::SedModel,
    tape::{Tape, Var},
};

/// Penalty added to the log posterior outside the valid parameter domain.
pub const DEFAULT_LOG_OUT: f64 = -1e15;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PosteriorError {
    #[error("unknown output mode: {0}")]
    UnknownOutputMode(String),
    #[error("expected {expected} parameters per row, got {found}")]
    Shape { expected: usize, found: usize },
    #[error("forward model predicts {predicted} bands, error function observes {observed}")]
    BandMismatch { predicted: usize, observed: usize },
    #[error("gradient output needs a single parameter row, got {0}")]
    BatchedGradient(usize),
    #[error("forward model failed: {0:#}")]
    Model(anyhow::Error),
    #[error("log posterior is not finite: {0}")]
    NonFiniteLogp(f64),
    #[error("could not access inference state")]
    Io(#[from] std::io::Error),
    #[error("could not (de)serialize inference state")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PosteriorError>;

/// Representation of a posterior evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Keep the recorded graph so callers can differentiate it.
    #[default]
    Differentiable,
    /// One plain value per parameter row.
    Plain,
    /// Value and gradient of a single parameter row.
    PlainWithGradient,
}

impl FromStr for OutputMode {
    type Err = PosteriorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "differentiable" | "torch" => Ok(OutputMode::Differentiable),
            "plain" | "numpy" => Ok(OutputMode::Plain),
            "plain_grad" | "numpy_grad" => Ok(OutputMode::PlainWithGradient),
            other => Err(PosteriorError::UnknownOutputMode(other.to_string())),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputMode::Differentiable => "differentiable",
            OutputMode::Plain => "plain",
            OutputMode::PlainWithGradient => "plain_grad",
        };
        f.write_str(name)
    }
}

/// How [`Posterior::evaluate`] formats and signs its result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSettings {
    pub mode: OutputMode,
    /// Multiply the output by -1, for minimizers.
    pub negative: bool,
    /// Added to the log posterior of rows outside the bounds.
    pub log_out: f64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            mode: OutputMode::Differentiable,
            negative: false,
            log_out: DEFAULT_LOG_OUT,
        }
    }
}

impl OutputSettings {
    pub fn sign(&self) -> f64 {
        if self.negative {
            -1.
        } else {
            1.
        }
    }
}

/// A recorded log-posterior evaluation that can still be differentiated.
#[derive(Debug, Clone)]
pub struct Graph {
    tape: Tape,
    inputs: Vec<Vec<Var>>,
    outputs: Vec<Var>,
}

impl Graph {
    /// Number of parameter rows.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.tape.vals(&self.outputs)
    }

    /// Value of a single-row evaluation.
    pub fn value(&self) -> Option<f64> {
        match self.outputs.as_slice() {
            [out] => Some(self.tape.val(*out)),
            _ => None,
        }
    }

    /// Gradient of the output of `row` with respect to that row's parameters.
    pub fn backward(&mut self, row: usize) -> Vec<f64> {
        self.tape.backward(self.outputs[row]);
        self.tape.adjoints(&self.inputs[row])
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }
}

/// Result of a posterior evaluation, one variant per [`OutputMode`].
#[derive(Debug, Clone)]
pub enum Evaluation {
    Differentiable(Graph),
    Plain(Vec<f64>),
    PlainWithGradient { value: f64, gradient: Vec<f64> },
}

impl Evaluation {
    /// The value of a single-row evaluation.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Evaluation::Differentiable(graph) => graph.value(),
            Evaluation::Plain(values) => match values.as_slice() {
                [value] => Some(*value),
                _ => None,
            },
            Evaluation::PlainWithGradient { value, .. } => Some(*value),
        }
    }

    /// One value per parameter row.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Evaluation::Differentiable(graph) => graph.values(),
            Evaluation::Plain(values) => values.clone(),
            Evaluation::PlainWithGradient { value, .. } => vec![*value],
        }
    }
}

/// Log posterior of an SED model under an error function.
///
/// The parameter vector is always laid out as the model parameters followed
/// by the free parameters of the error function.
#[derive(Debug)]
pub struct Posterior<M, E = ErrorKernel> {
    sed_model: M,
    error_func: E,
    settings: OutputSettings,
}

impl<M: SedModel, E: ErrorFunction> Posterior<M, E> {
    pub fn new(sed_model: M, error_func: E) -> Self {
        Self {
            sed_model,
            error_func,
            settings: OutputSettings::default(),
        }
    }

    pub fn sed_model(&self) -> &M {
        &self.sed_model
    }

    pub fn sed_model_mut(&mut self) -> &mut M {
        &mut self.sed_model
    }

    pub fn error_func(&self) -> &E {
        &self.error_func
    }

    pub fn set_error_func(&mut self, error_func: E) {
        self.error_func = error_func;
    }

    pub fn output_settings(&self) -> OutputSettings {
        self.settings
    }

    /// Configure the output of [`evaluate`](Self::evaluate).
    ///
    /// `mode` is one of `"differentiable"`, `"plain"` and `"plain_grad"`.
    /// Nothing changes if the mode is not recognised.
    pub fn configure_output_mode(&mut self, mode: &str, negative: bool, log_out: f64) -> Result<()> {
        let mode = mode.parse()?;
        self.set_output_settings(OutputSettings {
            mode,
            negative,
            log_out,
        });
        Ok(())
    }

    pub fn set_output_settings(&mut self, settings: OutputSettings) {
        debug!(
            "posterior output mode {} (negative: {}, log_out: {:e})",
            settings.mode, settings.negative, settings.log_out
        );
        self.settings = settings;
    }

    /// Total number of parameters.
    pub fn input_size(&self) -> usize {
        self.sed_model.input_size() + self.error_func.n_params()
    }

    pub fn param_names(&self) -> Vec<String> {
        let mut names = self.sed_model.param_names();
        names.extend(self.error_func.param_names());
        names
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let mut bounds = self.sed_model.bounds();
        bounds.extend(self.error_func.bounds());
        bounds
    }

    /// Evaluate one parameter row with the configured output settings.
    pub fn evaluate(&self, params: &[f64]) -> Result<Evaluation> {
        self.evaluate_with(params, self.settings)
    }

    /// Evaluate one parameter row per matrix row with the configured output settings.
    pub fn evaluate_batch(&self, params: MatRef<'_, f64>) -> Result<Evaluation> {
        self.evaluate_batch_with(params, self.settings)
    }

    pub fn evaluate_with(&self, params: &[f64], settings: OutputSettings) -> Result<Evaluation> {
        self.evaluate_rows(&[params], settings)
    }

    pub fn evaluate_batch_with(
        &self,
        params: MatRef<'_, f64>,
        settings: OutputSettings,
    ) -> Result<Evaluation> {
        let rows: Vec<Vec<f64>> = (0..params.nrows())
            .map(|i| (0..params.ncols()).map(|j| params[(i, j)]).collect())
            .collect();
        let rows: Vec<&[f64]> = rows.iter().map(Vec::as_slice).collect();
        self.evaluate_rows(&rows, settings)
    }

    fn evaluate_rows(&self, rows: &[&[f64]], settings: OutputSettings) -> Result<Evaluation> {
        if settings.mode == OutputMode::PlainWithGradient && rows.len() != 1 {
            return Err(PosteriorError::BatchedGradient(rows.len()));
        }

        let mut graph = self.record_rows(rows, settings)?;
        let evaluation = match settings.mode {
            OutputMode::Differentiable => Evaluation::Differentiable(graph),
            OutputMode::Plain => Evaluation::Plain(graph.values()),
            OutputMode::PlainWithGradient => {
                let gradient = graph.backward(0);
                Evaluation::PlainWithGradient {
                    value: graph.values()[0],
                    gradient,
                }
            }
        };
        Ok(evaluation)
    }

    /// Record the signed, penalised log posterior of every row on one tape.
    ///
    /// Only the sign and penalty of `settings` are used.
    pub(crate) fn record_rows(&self, rows: &[&[f64]], settings: OutputSettings) -> Result<Graph> {
        let mut tape = Tape::new();
        let mut inputs = Vec::with_capacity(rows.len());
        let mut outputs = Vec::with_capacity(rows.len());
        for row in rows {
            let (input, output) = self.record(&mut tape, row, settings)?;
            inputs.push(input);
            outputs.push(output);
        }
        Ok(Graph {
            tape,
            inputs,
            outputs,
        })
    }

    /// Record the log posterior of one row, returning its input nodes and output node.
    fn record(
        &self,
        tape: &mut Tape,
        row: &[f64],
        settings: OutputSettings,
    ) -> Result<(Vec<Var>, Var)> {
        let expected = self.input_size();
        if row.len() != expected {
            return Err(PosteriorError::Shape {
                expected,
                found: row.len(),
            });
        }

        let model_size = self.sed_model.input_size();
        let inputs = tape.vars(row);
        let (p_model, p_error) = inputs.split_at(model_size);

        let forward = self
            .sed_model
            .forward(tape, p_model, true)
            .map_err(PosteriorError::Model)?;
        let observed = self.error_func.n_obs();
        if forward.photometry.len() != observed {
            return Err(PosteriorError::BandMismatch {
                predicted: forward.photometry.len(),
                observed,
            });
        }
        let mut is_out = forward.is_out;
        if self.error_func.n_params() > 0 {
            is_out |= self.error_func.check_bounds(&row[model_size..]);
        }

        let score = self
            .error_func
            .log_likelihood(tape, &forward.photometry, p_error);
        let penalty = if is_out { settings.log_out } else { 0. };
        let log_post = tape.add_f64(score, penalty);
        let log_post = tape.scale(log_post, settings.sign());
        Ok((inputs, log_post))
    }

    /// Fill `position` with a random point well inside the bounds.
    ///
    /// Each parameter is drawn uniformly from the central 90% of its
    /// interval. All bounds must be finite.
    pub fn random_init<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) {
        let bounds = self.bounds();
        assert_eq!(position.len(), bounds.len());
        position
            .iter_mut()
            .zip(bounds)
            .for_each(|(val, (lower, upper))| {
                let frac: f64 = rng.random_range(0.05..0.95);
                *val = lower + frac * (upper - lower);
            });
    }
}
