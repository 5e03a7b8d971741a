//! Synthetic multichannel brain-source time series with known ground truth.
//!
//! `spiral-sim` builds configurations of simulated neural activity for
//! validating analysis pipelines (connectivity estimators, SNR-sensitive
//! methods) against a known answer. Callers register named point, patch, or
//! noise sources together with waveform specifications, target standard
//! deviations, SNR targets, and pairwise phase-coupling constraints, then
//! call [`SourceSimulator::simulate`] to realize one configuration.
//!
//! The engine resolves the coupling constraints into a dependency order
//! (rejecting cycles, self-coupling, and conflicting parents), generates
//! every waveform only after its parent exists, normalises amplitudes, and
//! adjusts local and global SNR in sensor space through an opaque forward
//! operator. Every random draw is derived from the top-level random state
//! and the source's name, so a fixed seed reproduces a configuration exactly
//! and structural edits never perturb unrelated sources.
//!
//! ```
//! use spiral_sim::{
//!     Band, Coupling, LocationSpec, PointSources, SourceSimulator, SourceSpace, Waveform,
//! };
//!
//! let src = SourceSpace::single(64).unwrap();
//! let mut sim = SourceSimulator::new(src);
//! sim.add_point_sources(
//!     PointSources::new(LocationSpec::RandomVertices { n: 2 }, Waveform::narrowband_alpha())
//!         .with_names(["s1", "s2"]),
//! )
//! .unwrap();
//! sim.set_coupling([(
//!     "s1",
//!     "s2",
//!     Coupling::ConstantPhaseShift {
//!         phase_lag: std::f64::consts::PI / 3.0,
//!     },
//! )])
//! .unwrap();
//! let config = sim.simulate(250.0, 4.0, None, None, None, Some(0)).unwrap();
//! assert_eq!(config.n_sources(), 2);
//! ```

pub mod configuration;
pub mod coupling;
pub mod determinism;
pub mod dsp;
pub mod error;
pub mod forward;
pub mod graph;
pub mod simulator;
pub mod snr;
pub mod source;
pub mod waveform;

pub use configuration::{ConfigurationSummary, SourceConfiguration, SourceSummary};
pub use coupling::{sample_von_mises, theoretical_plv, Coupling, CouplingEnvelope, CouplingFn};
pub use dsp::Band;
pub use error::{SimResult, SimulationError};
pub use forward::{ForwardModel, ForwardOperator};
pub use graph::{resolve_generation_order, CouplingEdge, GenerationStep};
pub use simulator::{NoiseSources, PatchSources, PointSources, SourceSimulator};
pub use snr::{amplitude_adjustment_factor, sensor_space_variance};
pub use source::{
    Location, LocationFn, LocationSpec, SimulatedSource, SourceActivation, SourceRole,
    SourceSpace,
};
pub use waveform::{sfreq_from_times, times_for, Waveform, WaveformFn};
