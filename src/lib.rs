//! Posterior evaluation and point estimates for parametric galaxy SED models.
//!
//! A [`Posterior`] glues a forward [`SedModel`] to an [`ErrorFunction`] and
//! evaluates the log posterior of a flat parameter vector laid out as
//! `[model parameters..., error function parameters...]`. Parameters at or
//! beyond their bounds receive a large negative penalty. Results come as a
//! differentiable graph, plain values, or a value with its gradient, so the
//! same posterior can drive the built-in [`optimize`] loop, an external
//! optimizer, or a gradient-based sampler through [`CpuLogpFunc`].

pub mod tape;

pub(crate) mod cpu_logp;
pub(crate) mod error_function;
pub(crate) mod inference_state;
pub(crate) mod optimize;
pub(crate) mod posterior;
pub(crate) mod sed_model;

pub use cpu_logp::{CpuLogpFunc, LogpError};
pub use error_function::{ErrorFunction, ErrorKernel, Gaussian, GaussianWithScatter};
pub use inference_state::{InferenceState, StateSource};
pub use optimize::{
    optimize, Adam, AdamOptions, Objective, OptimizeOptions, Optimizer, OptimizerKind,
    ProgressCallback, Sgd, SgdOptions,
};
pub use posterior::{
    Evaluation, Graph, OutputMode, OutputSettings, Posterior, PosteriorError, Result,
    DEFAULT_LOG_OUT,
};
pub use sed_model::{Forward, ModelConfig, SedModel};
