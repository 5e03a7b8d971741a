//! The immutable result of a simulation.
//!
//! A `SourceConfiguration` owns the realized waveform of every source plus
//! the simulation parameters needed to interpret them. It never changes
//! after creation; a fresh `simulate` call produces an independent
//! configuration.

use crate::determinism;
use crate::error::{SimResult, SimulationError};
use crate::forward::ForwardOperator;
use crate::source::{SimulatedSource, SourceActivation, SourceRole};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A simulated configuration of brain activity and noise sources.
#[derive(Debug, Clone)]
pub struct SourceConfiguration {
    sfreq: f64,
    duration: f64,
    times: Array1<f64>,
    seed: u64,
    random_state: Option<u64>,
    signal_sources: Vec<SimulatedSource>,
    noise_sources: Vec<SimulatedSource>,
    index: HashMap<String, (SourceRole, usize)>,
}

impl SourceConfiguration {
    pub(crate) fn new(
        sfreq: f64,
        duration: f64,
        times: Array1<f64>,
        seed: u64,
        random_state: Option<u64>,
        signal_sources: Vec<SimulatedSource>,
        noise_sources: Vec<SimulatedSource>,
    ) -> Self {
        let mut index = HashMap::with_capacity(signal_sources.len() + noise_sources.len());
        for (i, source) in signal_sources.iter().enumerate() {
            index.insert(source.name.clone(), (SourceRole::Signal, i));
        }
        for (i, source) in noise_sources.iter().enumerate() {
            index.insert(source.name.clone(), (SourceRole::Noise, i));
        }
        Self {
            sfreq,
            duration,
            times,
            seed,
            random_state,
            signal_sources,
            noise_sources,
            index,
        }
    }

    pub fn sfreq(&self) -> f64 {
        self.sfreq
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    pub fn times(&self) -> &Array1<f64> {
        &self.times
    }

    /// The random state the caller provided, if any.
    pub fn random_state(&self) -> Option<u64> {
        self.random_state
    }

    pub fn n_sources(&self) -> usize {
        self.signal_sources.len() + self.noise_sources.len()
    }

    /// All source names: signal sources first, then noise sources, each in
    /// registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signal_sources
            .iter()
            .chain(self.noise_sources.iter())
            .map(|source| source.name.as_str())
    }

    pub fn source(&self, name: &str) -> Option<&SimulatedSource> {
        let &(role, i) = self.index.get(name)?;
        Some(match role {
            SourceRole::Signal => &self.signal_sources[i],
            SourceRole::Noise => &self.noise_sources[i],
        })
    }

    /// The realized waveform of the named source.
    pub fn waveform(&self, name: &str) -> Option<&Array1<f64>> {
        self.source(name).map(|source| &source.waveform)
    }

    pub fn signal_sources(&self) -> &[SimulatedSource] {
        &self.signal_sources
    }

    pub fn noise_sources(&self) -> &[SimulatedSource] {
        &self.noise_sources
    }

    /// Stacks all sources (signal and noise) into a vertices x times
    /// activation; co-located sources are summed.
    pub fn to_source_activation(&self) -> SimResult<SourceActivation> {
        SourceActivation::combine(
            self.signal_sources.iter().chain(self.noise_sources.iter()),
            self.times.len(),
        )
    }

    /// Projects the full configuration to sensor space.
    ///
    /// When `sensor_noise_level` (gamma in `[0, 1]`) is given, white sensor
    /// noise is scaled to the mean sensor-space variance of the brain signal
    /// and mixed in as `sqrt(1 - gamma) * brain + sqrt(gamma) * noise`, so
    /// gamma is the fraction of total sensor power stemming from sensor
    /// noise.
    pub fn to_sensor_space(
        &self,
        forward: &dyn ForwardOperator,
        sensor_noise_level: Option<f64>,
    ) -> SimResult<Array2<f64>> {
        let activation = self.to_source_activation()?;
        let brain = forward.project(&activation)?;

        let gamma = match sensor_noise_level {
            None => return Ok(brain),
            Some(gamma) => gamma,
        };
        if !(0.0..=1.0).contains(&gamma) {
            return Err(SimulationError::InvalidParameter {
                name: "sensor_noise_level",
                reason: format!("expected a value in [0, 1], got {gamma}"),
            });
        }
        if gamma == 0.0 {
            return Ok(brain);
        }

        let (n_sensors, n_times) = brain.dim();
        let mut rng = determinism::rng_for(self.seed, "sensor-noise");
        let mut noise =
            Array2::from_shape_fn((n_sensors, n_times), |_| rng.sample(StandardNormal));

        // Equalise the mean sensor variance of noise and brain activity
        // before mixing.
        let brain_var = mean_variance(&brain);
        let noise_var = mean_variance(&noise);
        if noise_var > 0.0 && brain_var > 0.0 {
            let scale = (brain_var / noise_var).sqrt();
            noise.mapv_inplace(|v| v * scale);
        }

        Ok(&brain * (1.0 - gamma).sqrt() + &noise * gamma.sqrt())
    }

    /// Serializable description of the configuration.
    pub fn summary(&self) -> ConfigurationSummary {
        ConfigurationSummary {
            sfreq: self.sfreq,
            duration: self.duration,
            n_samples: self.times.len(),
            random_state: self.random_state,
            sources: self
                .signal_sources
                .iter()
                .chain(self.noise_sources.iter())
                .map(|source| SourceSummary {
                    name: source.name.clone(),
                    role: source.role,
                    n_vertices: source.locations.len(),
                })
                .collect(),
        }
    }
}

fn mean_variance(data: &Array2<f64>) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64
}

/// Compact report describing a finished configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSummary {
    pub sfreq: f64,
    pub duration: f64,
    pub n_samples: usize,
    pub random_state: Option<u64>,
    pub sources: Vec<SourceSummary>,
}

/// One source entry of a [`ConfigurationSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub name: String,
    pub role: SourceRole,
    pub n_vertices: usize,
}
