//! Minimal restartable snapshot of a posterior.
//!
//! A snapshot holds the error function, the adapter and detector
//! configuration of the SED model, and an arbitrary user payload. It is
//! written as a single JSON document.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error_function::ErrorFunction,
    posterior::{Posterior, PosteriorError, Result},
    sed_model::{ModelConfig, SedModel},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceState<E, D> {
    error_func: E,
    #[serde(default)]
    adapter_config: ModelConfig,
    #[serde(default)]
    detector_config: ModelConfig,
    data: D,
}

impl<E, D> InferenceState<E, D> {
    pub fn new(
        error_func: E,
        adapter_config: ModelConfig,
        detector_config: ModelConfig,
        data: D,
    ) -> Self {
        Self {
            error_func,
            adapter_config,
            detector_config,
            data,
        }
    }

    pub fn error_func(&self) -> &E {
        &self.error_func
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// The adapter and detector configuration, in that order.
    pub fn get_config(&self) -> (&ModelConfig, &ModelConfig) {
        (&self.adapter_config, &self.detector_config)
    }

    /// Split into error function, adapter config, detector config and payload.
    pub fn into_parts(self) -> (E, ModelConfig, ModelConfig, D) {
        (
            self.error_func,
            self.adapter_config,
            self.detector_config,
            self.data,
        )
    }
}

impl<E: Serialize, D: Serialize> InferenceState<E, D> {
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        debug!("saved inference state to {}", path.display());
        Ok(())
    }
}

impl<E: DeserializeOwned, D: DeserializeOwned> InferenceState<E, D> {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let state = Self::from_reader(BufReader::new(File::open(path)?))?;
        debug!("loaded inference state from {}", path.display());
        Ok(state)
    }
}

/// Where [`Posterior::load_inference_state`] takes its snapshot from.
#[derive(Debug)]
pub enum StateSource<E, D> {
    State(InferenceState<E, D>),
    Path(PathBuf),
}

impl<E, D> From<InferenceState<E, D>> for StateSource<E, D> {
    fn from(state: InferenceState<E, D>) -> Self {
        StateSource::State(state)
    }
}

impl<E, D> From<PathBuf> for StateSource<E, D> {
    fn from(path: PathBuf) -> Self {
        StateSource::Path(path)
    }
}

impl<E, D> From<&Path> for StateSource<E, D> {
    fn from(path: &Path) -> Self {
        StateSource::Path(path.to_path_buf())
    }
}

impl<E, D> From<&str> for StateSource<E, D> {
    fn from(path: &str) -> Self {
        StateSource::Path(path.into())
    }
}

impl<M: SedModel, E: ErrorFunction + Clone> Posterior<M, E> {
    /// Snapshot the error function and the model configuration along with `data`.
    pub fn inference_state<D>(&self, data: D) -> InferenceState<E, D> {
        InferenceState::new(
            self.error_func().clone(),
            self.sed_model().input_config(),
            self.sed_model().output_config(),
            data,
        )
    }

    pub fn save_inference_state<D: Serialize>(&self, path: impl AsRef<Path>, data: D) -> Result<()>
    where
        E: Serialize,
    {
        self.inference_state(data).save(path)
    }

    /// Restore the error function and model configuration from a snapshot.
    ///
    /// Returns the payload stored with the snapshot. If the model rejects the
    /// configuration, its previous configuration is reapplied and the error
    /// function is left unchanged.
    pub fn load_inference_state<D: DeserializeOwned>(
        &mut self,
        source: impl Into<StateSource<E, D>>,
    ) -> Result<D>
    where
        E: DeserializeOwned,
    {
        let state = match source.into() {
            StateSource::State(state) => state,
            StateSource::Path(path) => InferenceState::load(path)?,
        };
        let (error_func, adapter_config, detector_config, data) = state.into_parts();
        let previous = (
            self.sed_model().input_config(),
            self.sed_model().output_config(),
        );
        if let Err(err) = self.configure_model(&adapter_config, &detector_config) {
            if let Err(restore) = self.configure_model(&previous.0, &previous.1) {
                warn!("could not restore the previous model configuration: {restore:#}");
            }
            return Err(PosteriorError::Model(err));
        }
        self.set_error_func(error_func);
        Ok(data)
    }

    fn configure_model(
        &mut self,
        adapter_config: &ModelConfig,
        detector_config: &ModelConfig,
    ) -> anyhow::Result<()> {
        let model = self.sed_model_mut();
        model.configure_input_mode(adapter_config)?;
        model.configure_output_mode(detector_config)
    }
}
