//! Fit a power-law SED with an unknown intrinsic scatter.
//!
//! Simulates noisy photometry, finds the maximum a posteriori point with
//! Adam, then saves and restores the inference state.

use std::f64::consts::LN_10;

use anyhow::{bail, Result};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use sed_posterior::{
    optimize,
    tape::{Tape, Var},
    AdamOptions, ErrorKernel, Forward, GaussianWithScatter, ModelConfig, OptimizeOptions,
    OptimizerKind, Posterior, ProgressCallback, SedModel, DEFAULT_LOG_OUT,
};
use serde_json::json;

// Fluxes 10^log_amp * (lam / (1 + z))^slope in a handful of bands.
struct PowerLaw {
    wavelengths: Vec<f64>,
    redshift: f64,
}

impl PowerLaw {
    fn fluxes(&self, log_amp: f64, slope: f64) -> Vec<f64> {
        self.wavelengths
            .iter()
            .map(|lam| (LN_10 * log_amp + slope * (lam / (1. + self.redshift)).ln()).exp())
            .collect()
    }
}

impl SedModel for PowerLaw {
    fn input_size(&self) -> usize {
        2
    }

    fn param_names(&self) -> Vec<String> {
        vec!["log_amp".into(), "slope".into()]
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(-1., 1.), (-3., 3.)]
    }

    fn forward(&self, tape: &mut Tape, params: &[Var], check_bounds: bool) -> Result<Forward> {
        let amp = tape.scale(params[0], LN_10);
        let photometry = self
            .wavelengths
            .iter()
            .map(|lam| {
                let tilt = tape.scale(params[1], (lam / (1. + self.redshift)).ln());
                let exponent = tape.add(amp, tilt);
                tape.exp(exponent)
            })
            .collect();
        let is_out = check_bounds
            && tape
                .vals(params)
                .iter()
                .zip(self.bounds())
                .any(|(&val, (lower, upper))| val <= lower || val >= upper);
        Ok(Forward { photometry, is_out })
    }

    fn input_config(&self) -> ModelConfig {
        ModelConfig::from([("redshift".to_string(), json!(self.redshift))])
    }

    fn output_config(&self) -> ModelConfig {
        ModelConfig::new()
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
        if let Some(key) = config.keys().next() {
            bail!("unsupported detector option {key}");
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let model = PowerLaw {
        wavelengths: vec![0.35, 0.48, 0.62, 0.77, 0.91, 1.25, 1.65, 2.2],
        redshift: 0.1,
    };
    let (true_amp, true_slope, true_sigma) = (0.2, -0.8, 0.05);

    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0., true_sigma)?;
    let y_obs: Vec<f64> = model
        .fluxes(true_amp, true_slope)
        .into_iter()
        .map(|flux| flux + noise.sample(&mut rng))
        .collect();

    let mut posterior = Posterior::new(model, ErrorKernel::from(GaussianWithScatter::new(y_obs)));
    posterior.configure_output_mode("differentiable", true, DEFAULT_LOG_OUT)?;

    let mut x0 = vec![0.; posterior.input_size()];
    posterior.random_init(&mut rng, &mut x0);
    println!("Parameters: {:?}", posterior.param_names());
    println!("Start:      {x0:.3?}");

    let options = OptimizeOptions {
        n_steps: 5000,
        learning_rate: 1e-2,
        show_progress: true,
        progress: Some(ProgressCallback::new(|step, total, desc: &str| {
            if step % 1000 == 0 {
                println!("step {step}/{total}: {desc}");
            }
        })),
    };
    let best = optimize(
        &posterior,
        OptimizerKind::Adam(AdamOptions::default()),
        &x0,
        options,
    )?;
    println!("Best fit:   {best:.3?}");
    println!(
        "Truth:      [{true_amp:.3}, {true_slope:.3}, {:.3}]",
        true_sigma.log10()
    );

    let path = std::env::temp_dir().join("fit_power_law_state.json");
    posterior.save_inference_state(&path, best.clone())?;
    println!("Saved inference state to {}", path.display());

    let restored_best: Vec<f64> = posterior.load_inference_state(path.as_path())?;
    posterior.configure_output_mode("plain", false, DEFAULT_LOG_OUT)?;
    let log_post = posterior.evaluate(&restored_best)?.scalar();
    println!("Log posterior at restored best fit: {log_post:?}");
    Ok(())
}
