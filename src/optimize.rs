//! Gradient-based point estimates of a posterior.
//!
//! [`optimize`] minimizes the (signed) log posterior with a first-order
//! optimizer for a fixed number of steps. There is no convergence check; to
//! maximize the log posterior configure the posterior with `negative = true`.

use log::{info, warn};

use crate::{
    error_function::ErrorFunction,
    posterior::{Graph, OutputSettings, Posterior, Result},
    sed_model::SedModel,
};

/// A first-order optimizer over a flat parameter vector.
pub trait Optimizer {
    /// Update `params` in place from the gradient of the loss.
    fn step(&mut self, params: &mut [f64], grad: &[f64]);
}

/// Settings for stochastic gradient descent
#[derive(Debug, Clone, Copy)]
pub struct SgdOptions {
    /// Momentum factor (default: 0, plain gradient descent)
    pub momentum: f64,
}

impl Default for SgdOptions {
    fn default() -> Self {
        Self { momentum: 0. }
    }
}

/// Gradient descent with optional heavy-ball momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
    settings: SgdOptions,
    velocity: Vec<f64>,
}

impl Sgd {
    pub fn new(settings: SgdOptions, learning_rate: f64, dim: usize) -> Self {
        Self {
            learning_rate,
            settings,
            velocity: vec![0.; dim],
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        assert!(params.len() == grad.len());
        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((param, &grad), velocity)| {
                *velocity = self.settings.momentum * *velocity + grad;
                *param -= self.learning_rate * *velocity;
            });
    }
}

/// Settings for the Adam optimizer
#[derive(Debug, Clone, Copy)]
pub struct AdamOptions {
    /// First moment decay rate (default: 0.9)
    pub beta1: f64,
    /// Second moment decay rate (default: 0.999)
    pub beta2: f64,
    /// Small constant for numerical stability (default: 1e-8)
    pub epsilon: f64,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam with per-coordinate first and second moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    settings: AdamOptions,
    /// First moment estimate
    m: Vec<f64>,
    /// Second moment estimate
    v: Vec<f64>,
    /// Iteration counter
    t: i32,
}

impl Adam {
    pub fn new(settings: AdamOptions, learning_rate: f64, dim: usize) -> Self {
        Self {
            learning_rate,
            settings,
            m: vec![0.; dim],
            v: vec![0.; dim],
            t: 0,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        assert!(params.len() == grad.len());
        let AdamOptions {
            beta1,
            beta2,
            epsilon,
        } = self.settings;

        self.t = self.t.saturating_add(1);
        let bias1 = 1. - beta1.powi(self.t);
        let bias2 = 1. - beta2.powi(self.t);

        for (((param, &grad), m), v) in params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = beta1 * *m + (1. - beta1) * grad;
            *v = beta2 * *v + (1. - beta2) * grad * grad;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *param -= self.learning_rate * m_hat / (v_hat.sqrt() + epsilon);
        }
    }
}

/// Which optimizer [`optimize`] runs, with its extra options.
#[derive(Debug, Clone, Copy)]
pub enum OptimizerKind {
    Sgd(SgdOptions),
    Adam(AdamOptions),
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam(AdamOptions::default())
    }
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f64, dim: usize) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Sgd(settings) => Box::new(Sgd::new(settings, learning_rate, dim)),
            OptimizerKind::Adam(settings) => Box::new(Adam::new(settings, learning_rate, dim)),
        }
    }
}

/// Receives `(step, n_steps, description)` after every optimization step.
pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(u64, u64, &str)>,
}

impl ProgressCallback {
    pub fn new(callback: impl FnMut(u64, u64, &str) + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

pub struct OptimizeOptions {
    pub n_steps: u64,
    pub learning_rate: f64,
    /// Report progress through `progress`, or the log if no callback is set.
    pub show_progress: bool,
    pub progress: Option<ProgressCallback>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            n_steps: 1000,
            learning_rate: 1e-2,
            show_progress: true,
            progress: None,
        }
    }
}

/// The loss seen by an optimizer.
///
/// The posterior is only borrowed; the parameter vector and its accumulated
/// gradient are the only learnable state.
pub struct Objective<'a, M, E> {
    posterior: &'a Posterior<M, E>,
    settings: OutputSettings,
    params: Vec<f64>,
    grad: Vec<f64>,
}

impl<'a, M: SedModel, E: ErrorFunction> Objective<'a, M, E> {
    /// Uses the sign and penalty configured on `posterior`, whatever its
    /// output mode.
    pub fn new(posterior: &'a Posterior<M, E>, params: Vec<f64>) -> Self {
        let settings = posterior.output_settings();
        let grad = vec![0.; params.len()];
        Self {
            posterior,
            settings,
            params,
            grad,
        }
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn grad(&self) -> &[f64] {
        &self.grad
    }

    /// The learnable parameters and their gradient.
    pub fn parameters_mut(&mut self) -> (&mut [f64], &[f64]) {
        (self.params.as_mut_slice(), self.grad.as_slice())
    }

    /// Record the loss at the current parameters.
    pub fn forward(&self) -> Result<Graph> {
        self.posterior
            .record_rows(&[self.params.as_slice()], self.settings)
    }

    /// Add the gradient of `graph` to the accumulated gradient.
    pub fn backward(&mut self, graph: &mut Graph) {
        let grad = graph.backward(0);
        self.grad.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    pub fn into_params(self) -> Vec<f64> {
        self.params
    }
}

/// Minimize the output of `posterior` starting from `initial_params`.
///
/// Runs exactly `options.n_steps` steps and returns the final parameters.
pub fn optimize<M: SedModel, E: ErrorFunction>(
    posterior: &Posterior<M, E>,
    kind: OptimizerKind,
    initial_params: &[f64],
    options: OptimizeOptions,
) -> Result<Vec<f64>> {
    let OptimizeOptions {
        n_steps,
        learning_rate,
        show_progress,
        mut progress,
    } = options;

    let mut objective = Objective::new(posterior, initial_params.to_vec());
    let mut optimizer = kind.build(learning_rate, initial_params.len());
    let mut warned = false;

    for i_step in 0..n_steps {
        let mut graph = objective.forward()?;
        let loss = graph.values()[0];
        objective.backward(&mut graph);
        let (params, grad) = objective.parameters_mut();
        optimizer.step(params, grad);
        objective.zero_grad();

        if !loss.is_finite() && !warned {
            warn!("non-finite loss {loss} at optimization step {i_step}");
            warned = true;
        }
        if show_progress {
            let description = format!("loss: {loss:.3e}");
            match progress.as_mut() {
                Some(ProgressCallback { callback }) => callback(i_step + 1, n_steps, &description),
                None => info!("step {}/{}: {}", i_step + 1, n_steps, description),
            }
        }
    }

    Ok(objective.into_params())
}
