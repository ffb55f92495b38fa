//! Likelihood kernels scoring predicted photometry against observations.
//!
//! A kernel may carry its own free nuisance parameters. Those are appended
//! after the physical parameters in the posterior's parameter vector and
//! come with their own bounds.

use std::f64::consts::PI;

use itertools::izip;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::sed_model::beyond_bounds;
use crate::tape::{Tape, Var};

/// A pluggable error model.
pub trait ErrorFunction {
    /// Number of observed bands the kernel scores.
    fn n_obs(&self) -> usize;

    /// Names of the kernel's free parameters, possibly empty.
    fn param_names(&self) -> Vec<String>;

    /// `(lower, upper)` per free parameter, in `param_names` order.
    fn bounds(&self) -> Vec<(f64, f64)>;

    fn n_params(&self) -> usize {
        self.param_names().len()
    }

    /// Whether any free parameter is at or beyond its bounds.
    ///
    /// # Panics
    ///
    /// If the kernel declares no free parameters.
    fn check_bounds(&self, params: &[f64]) -> bool {
        assert!(
            self.n_params() > 0,
            "check_bounds called on an error function without free parameters"
        );
        beyond_bounds(params.iter().copied(), &self.bounds())
    }

    /// Log-likelihood of one row of predictions.
    ///
    /// `params` holds exactly `n_params()` nodes.
    fn log_likelihood(&self, tape: &mut Tape, y_pred: &[Var], params: &[Var]) -> Var;
}

#[derive(Debug, Clone, Copy)]
enum BandError<'a> {
    /// One fixed uncertainty per band.
    Fixed(&'a [f64]),
    /// A single uncertainty on the tape, shared by all bands.
    Shared(Var),
}

/// Sum over bands of `-0.5 * ((pred - obs) / err)^2`.
fn chi2_term(tape: &mut Tape, y_pred: &[Var], y_obs: &[f64], err: BandError) -> Var {
    assert_eq!(y_pred.len(), y_obs.len(), "prediction/observation size mismatch");
    let terms: Vec<Var> = izip!(0.., y_pred, y_obs)
        .map(|(band, &pred, &obs)| {
            let diff = tape.sub_f64(pred, obs);
            let delta = match err {
                BandError::Fixed(y_err) => tape.div_f64(diff, y_err[band]),
                BandError::Shared(sigma) => tape.div(diff, sigma),
            };
            let sq = tape.powi(delta, 2);
            tape.scale(sq, -0.5)
        })
        .collect();
    tape.sum(&terms)
}

/// JSON has no infinities or NaN, so kernels write non-finite values as the
/// strings `"inf"`, `"-inf"` and `"NaN"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FloatRepr {
    Number(f64),
    Text(String),
}

impl From<f64> for FloatRepr {
    fn from(val: f64) -> Self {
        if val.is_finite() {
            FloatRepr::Number(val)
        } else {
            FloatRepr::Text(val.to_string())
        }
    }
}

impl FloatRepr {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            FloatRepr::Number(val) => Ok(val),
            FloatRepr::Text(text) => text
                .parse()
                .map_err(|e| E::custom(format!("Failed to parse float {text:?}: {e}"))),
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_float<S: Serializer>(val: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    FloatRepr::from(*val).serialize(serializer)
}

fn deserialize_float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    FloatRepr::deserialize(deserializer)?.into_f64()
}

fn serialize_floats<S: Serializer>(vals: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(vals.iter().map(|&val| FloatRepr::from(val)))
}

fn deserialize_floats<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    Vec::<FloatRepr>::deserialize(deserializer)?
        .into_iter()
        .map(FloatRepr::into_f64)
        .collect()
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_bounds<S: Serializer>(bounds: &(f64, f64), serializer: S) -> Result<S::Ok, S::Error> {
    (FloatRepr::from(bounds.0), FloatRepr::from(bounds.1)).serialize(serializer)
}

fn deserialize_bounds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(f64, f64), D::Error> {
    let (lower, upper) = <(FloatRepr, FloatRepr)>::deserialize(deserializer)?;
    Ok((lower.into_f64()?, upper.into_f64()?))
}

/// Gaussian errors with fixed per-band uncertainties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gaussian {
    #[serde(serialize_with = "serialize_floats", deserialize_with = "deserialize_floats")]
    y_obs: Vec<f64>,
    #[serde(serialize_with = "serialize_floats", deserialize_with = "deserialize_floats")]
    y_err: Vec<f64>,
    #[serde(serialize_with = "serialize_float", deserialize_with = "deserialize_float")]
    norm: f64,
}

impl Gaussian {
    /// If `norm` is set, the Gaussian normalisation `-ln(sqrt(2 pi) err)`
    /// summed over bands is added to every score.
    pub fn new(y_obs: Vec<f64>, y_err: Vec<f64>, norm: bool) -> Self {
        assert_eq!(y_obs.len(), y_err.len(), "y_obs and y_err differ in length");
        let norm = if norm {
            y_err.iter().map(|err| -((2. * PI).sqrt() * err).ln()).sum()
        } else {
            0.
        };
        Self { y_obs, y_err, norm }
    }

    pub fn y_obs(&self) -> &[f64] {
        &self.y_obs
    }

    pub fn y_err(&self) -> &[f64] {
        &self.y_err
    }

    /// The constant added to every score.
    pub fn norm(&self) -> f64 {
        self.norm
    }
}

impl ErrorFunction for Gaussian {
    fn n_obs(&self) -> usize {
        self.y_obs.len()
    }

    fn param_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        Vec::new()
    }

    fn log_likelihood(&self, tape: &mut Tape, y_pred: &[Var], _params: &[Var]) -> Var {
        let chi2 = chi2_term(tape, y_pred, &self.y_obs, BandError::Fixed(&self.y_err));
        tape.add_f64(chi2, self.norm)
    }
}

/// Gaussian errors with one intrinsic scatter shared by all bands.
///
/// The free parameter `sigma` is sampled as `log10(sigma)`; its bounds are
/// given in that scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianWithScatter {
    #[serde(serialize_with = "serialize_floats", deserialize_with = "deserialize_floats")]
    y_obs: Vec<f64>,
    #[serde(serialize_with = "serialize_bounds", deserialize_with = "deserialize_bounds")]
    bounds: (f64, f64),
}

impl GaussianWithScatter {
    pub const DEFAULT_BOUNDS: (f64, f64) = (-2., 0.);

    pub fn new(y_obs: Vec<f64>) -> Self {
        Self::with_bounds(y_obs, Self::DEFAULT_BOUNDS)
    }

    pub fn with_bounds(y_obs: Vec<f64>, bounds: (f64, f64)) -> Self {
        Self { y_obs, bounds }
    }

    pub fn y_obs(&self) -> &[f64] {
        &self.y_obs
    }
}

impl ErrorFunction for GaussianWithScatter {
    fn n_obs(&self) -> usize {
        self.y_obs.len()
    }

    fn param_names(&self) -> Vec<String> {
        vec!["sigma".to_string()]
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![self.bounds]
    }

    fn n_params(&self) -> usize {
        1
    }

    fn log_likelihood(&self, tape: &mut Tape, y_pred: &[Var], params: &[Var]) -> Var {
        let sigma = tape.pow10(params[0]);
        let chi2 = chi2_term(tape, y_pred, &self.y_obs, BandError::Shared(sigma));
        // M * ln(sqrt(2 pi) sigma)
        let scaled = tape.scale(sigma, (2. * PI).sqrt());
        let log_norm = tape.ln(scaled);
        let log_norm = tape.scale(log_norm, self.y_obs.len() as f64);
        tape.sub(chi2, log_norm)
    }
}

/// The error functions that can be persisted in an inference state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKernel {
    Gaussian(Gaussian),
    GaussianWithScatter(GaussianWithScatter),
}

impl ErrorKernel {
    fn inner(&self) -> &dyn ErrorFunction {
        match self {
            ErrorKernel::Gaussian(kernel) => kernel,
            ErrorKernel::GaussianWithScatter(kernel) => kernel,
        }
    }
}

impl ErrorFunction for ErrorKernel {
    fn n_obs(&self) -> usize {
        self.inner().n_obs()
    }

    fn param_names(&self) -> Vec<String> {
        self.inner().param_names()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.inner().bounds()
    }

    fn n_params(&self) -> usize {
        self.inner().n_params()
    }

    fn check_bounds(&self, params: &[f64]) -> bool {
        self.inner().check_bounds(params)
    }

    fn log_likelihood(&self, tape: &mut Tape, y_pred: &[Var], params: &[Var]) -> Var {
        self.inner().log_likelihood(tape, y_pred, params)
    }
}

impl From<Gaussian> for ErrorKernel {
    fn from(kernel: Gaussian) -> Self {
        ErrorKernel::Gaussian(kernel)
    }
}

impl From<GaussianWithScatter> for ErrorKernel {
    fn from(kernel: GaussianWithScatter) -> Self {
        ErrorKernel::GaussianWithScatter(kernel)
    }
}
