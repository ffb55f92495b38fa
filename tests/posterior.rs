use std::f64::consts::LN_10;

use anyhow::{bail, Result};
use approx::assert_abs_diff_eq;
use pretty_assertions::assert_eq;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use sed_posterior::{
    optimize,
    tape::{Tape, Var},
    AdamOptions, CpuLogpFunc, ErrorFunction, ErrorKernel, Evaluation, Forward, Gaussian,
    GaussianWithScatter, InferenceState, ModelConfig, OptimizeOptions, OptimizerKind, Posterior,
    SedModel, DEFAULT_LOG_OUT,
};
use serde_json::json;

/// Power-law fluxes `f = 10^log_amp * (lam / lam_ref)^slope` observed at
/// redshift `z`, scaled by the detector's `flux_scale`.
#[derive(Debug, Clone)]
struct PowerLawSed {
    wavelengths: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    redshift: f64,
    flux_scale: f64,
}

impl PowerLawSed {
    fn new(n_bands: usize) -> Self {
        Self {
            wavelengths: (0..n_bands).map(|k| 0.4 + 0.2 * k as f64).collect(),
            bounds: vec![(0., 1.), (0., 1.)],
            redshift: 0.,
            flux_scale: 1.,
        }
    }

    fn log_ratios(&self) -> impl Iterator<Item = f64> + '_ {
        let lam_ref = 1. + self.redshift;
        self.wavelengths.iter().map(move |lam| (lam / lam_ref).ln())
    }

    fn fluxes(&self, log_amp: f64, slope: f64) -> Vec<f64> {
        self.log_ratios()
            .map(|ratio| self.flux_scale * (LN_10 * log_amp + slope * ratio).exp())
            .collect()
    }
}

impl SedModel for PowerLawSed {
    fn input_size(&self) -> usize {
        2
    }

    fn param_names(&self) -> Vec<String> {
        vec!["log_amp".to_string(), "slope".to_string()]
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.bounds.clone()
    }

    fn forward(&self, tape: &mut Tape, params: &[Var], check_bounds: bool) -> Result<Forward> {
        let amp = tape.scale(params[0], LN_10);
        let photometry = self
            .log_ratios()
            .map(|ratio| {
                let tilt = tape.scale(params[1], ratio);
                let exponent = tape.add(amp, tilt);
                let flux = tape.exp(exponent);
                tape.scale(flux, self.flux_scale)
            })
            .collect();
        let is_out = check_bounds
            && tape
                .vals(params)
                .iter()
                .zip(&self.bounds)
                .any(|(val, (lower, upper))| val <= lower || val >= upper);
        Ok(Forward { photometry, is_out })
    }

    fn input_config(&self) -> ModelConfig {
        ModelConfig::from([("redshift".to_string(), json!(self.redshift))])
    }

    fn output_config(&self) -> ModelConfig {
        ModelConfig::from([("flux_scale".to_string(), json!(self.flux_scale))])
    }

    fn configure_input_mode(&mut self, config: &ModelConfig) -> Result<()> {
        for (key, val) in config {
            match (key.as_str(), val.as_f64()) {
                ("redshift", Some(z)) => self.redshift = z,
                _ => bail!("unsupported adapter option {key}"),
            }
        }
        Ok(())
    }

    fn configure_output_mode(&mut self, config: &ModelConfig) -> Result<()> {
        for (key, val) in config {
            match (key.as_str(), val.as_f64()) {
                ("flux_scale", Some(scale)) => self.flux_scale = scale,
                _ => bail!("unsupported detector option {key}"),
            }
        }
        Ok(())
    }
}

fn noisy_fluxes(model: &PowerLawSed, truth: (f64, f64), noise: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = Normal::new(0., noise).unwrap();
    model
        .fluxes(truth.0, truth.1)
        .into_iter()
        .map(|flux| flux + dist.sample(&mut rng))
        .collect()
}

#[test]
fn out_of_bounds_rows_are_penalised() {
    let model = PowerLawSed::new(6);
    let y_obs = model.fluxes(0.3, 0.6);
    let kernel = Gaussian::new(y_obs, vec![0.1; 6], true);
    let mut posterior = Posterior::new(model, ErrorKernel::from(kernel));
    assert_eq!(posterior.error_func().n_params(), 0);

    posterior
        .configure_output_mode("plain", false, DEFAULT_LOG_OUT)
        .unwrap();
    let finite = posterior.evaluate(&[0.5, 0.5]).unwrap().scalar().unwrap();
    assert!(finite.is_finite());
    assert!(finite > -1e6);

    let penalised = posterior.evaluate(&[-1., 0.5]).unwrap().scalar().unwrap();
    assert!(penalised <= finite + DEFAULT_LOG_OUT + 1.);
}

#[test]
fn names_and_bounds_track_the_error_function() {
    let model = PowerLawSed::new(4);
    let y_obs = model.fluxes(0.3, 0.6);
    let mut posterior = Posterior::new(
        model,
        ErrorKernel::from(GaussianWithScatter::with_bounds(y_obs.clone(), (-3., 1.))),
    );
    assert_eq!(posterior.param_names(), vec!["log_amp", "slope", "sigma"]);
    assert_eq!(posterior.bounds(), vec![(0., 1.), (0., 1.), (-3., 1.)]);
    assert_eq!(posterior.input_size(), posterior.param_names().len());

    posterior.set_error_func(Gaussian::new(y_obs, vec![0.1; 4], false).into());
    assert_eq!(posterior.param_names(), vec!["log_amp", "slope"]);
    assert_eq!(posterior.input_size(), posterior.bounds().len());
}

#[test]
fn saved_state_restores_a_fresh_posterior() -> anyhow::Result<()> {
    let mut model = PowerLawSed::new(5);
    model.redshift = 0.3;
    model.flux_scale = 2.;
    let y_obs = model.fluxes(0.4, 0.2);
    let mut saved = Posterior::new(model, ErrorKernel::from(GaussianWithScatter::new(y_obs)));
    saved.configure_output_mode("plain", false, DEFAULT_LOG_OUT)?;

    let path = std::env::temp_dir().join(format!(
        "sed-posterior-state-{}-{}.json",
        std::process::id(),
        line!()
    ));
    let payload = json!({"chain": 3, "best": [0.4, 0.2, -1.0]});
    saved.save_inference_state(&path, payload.clone())?;

    let fresh_kernel = Gaussian::new(vec![1.; 5], vec![1.; 5], true);
    let mut restored = Posterior::new(PowerLawSed::new(5), ErrorKernel::from(fresh_kernel));
    restored.configure_output_mode("plain", false, DEFAULT_LOG_OUT)?;
    let data: serde_json::Value = restored.load_inference_state(path.as_path())?;
    std::fs::remove_file(&path)?;

    assert_eq!(data, payload);
    assert_eq!(restored.sed_model().redshift, 0.3);
    assert_eq!(restored.sed_model().flux_scale, 2.);
    assert_eq!(restored.param_names(), saved.param_names());
    for row in [[0.4, 0.2, -1.], [0.7, 0.9, -0.2], [1.5, 0.5, -1.]] {
        assert_eq!(
            restored.evaluate(&row)?.values(),
            saved.evaluate(&row)?.values()
        );
    }
    Ok(())
}

#[test]
fn snapshot_can_be_passed_in_memory() {
    let model = PowerLawSed::new(3);
    let kernel = ErrorKernel::from(GaussianWithScatter::new(model.fluxes(0.5, 0.5)));
    let posterior = Posterior::new(model, kernel.clone());
    let state: InferenceState<ErrorKernel, Vec<u8>> = posterior.inference_state(vec![1, 2, 3]);
    assert_eq!(state.error_func(), &kernel);

    let mut other = Posterior::new(
        PowerLawSed::new(3),
        ErrorKernel::from(Gaussian::new(vec![0.; 3], vec![1.; 3], true)),
    );
    assert_eq!(other.load_inference_state(state).unwrap(), vec![1, 2, 3]);
    assert_eq!(other.error_func(), &kernel);
}

#[test]
fn adam_fit_recovers_power_law_and_scatter() {
    let model = PowerLawSed::new(12);
    let truth = (0.3, 0.6);
    let y_obs = noisy_fluxes(&model, truth, 0.05, 7);
    let mut posterior = Posterior::new(model, ErrorKernel::from(GaussianWithScatter::new(y_obs)));
    posterior
        .configure_output_mode("differentiable", true, DEFAULT_LOG_OUT)
        .unwrap();

    let best = optimize(
        &posterior,
        OptimizerKind::Adam(AdamOptions::default()),
        &[0.5, 0.5, -0.5],
        OptimizeOptions {
            n_steps: 3000,
            learning_rate: 1e-2,
            show_progress: false,
            ..Default::default()
        },
    )
    .unwrap();

    assert_abs_diff_eq!(best[0], truth.0, epsilon = 5e-2);
    assert_abs_diff_eq!(best[1], truth.1, epsilon = 1e-1);
    let (lower, upper) = GaussianWithScatter::DEFAULT_BOUNDS;
    assert!(best[2] > lower && best[2] < upper);

    // Minimizing the negated log posterior maximizes the log posterior
    posterior
        .configure_output_mode("plain", false, DEFAULT_LOG_OUT)
        .unwrap();
    let at_best = posterior.evaluate(&best).unwrap().scalar().unwrap();
    let at_start = posterior.evaluate(&[0.5, 0.5, -0.5]).unwrap().scalar().unwrap();
    assert!(at_best > at_start);
}

#[test]
fn posterior_serves_gradient_consumers() {
    fn ascend<F: CpuLogpFunc>(func: &mut F, position: &mut [f64], rate: f64, steps: usize) -> f64 {
        let mut grad = vec![0.; func.dim()];
        let mut logp = func.logp(position, &mut grad).unwrap();
        for _ in 0..steps {
            position
                .iter_mut()
                .zip(&grad)
                .for_each(|(x, g)| *x += rate * g);
            logp = func.logp(position, &mut grad).unwrap();
        }
        logp
    }

    let model = PowerLawSed::new(6);
    let y_obs = model.fluxes(0.3, 0.6);
    let mut posterior = Posterior::new(model, ErrorKernel::from(Gaussian::new(y_obs, vec![1.; 6], true)));
    posterior
        .configure_output_mode("plain_grad", false, DEFAULT_LOG_OUT)
        .unwrap();

    let mut position = [0.5, 0.5];
    let Evaluation::PlainWithGradient { value: start, .. } = posterior.evaluate(&position).unwrap()
    else {
        panic!("expected value and gradient");
    };
    let end = ascend(&mut posterior, &mut position, 1e-3, 50);
    assert!(end > start);
}
