use thiserror::Error;

/// Result alias used throughout the crate.
pub type SimResult<T> = Result<T, SimulationError>;

/// Errors emitted by the builder, the coupling graph, and the simulation
/// driver. Builder errors leave the registry untouched; driver errors abort
/// the whole `simulate` call without producing a partial configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error("a source named '{name}' is already registered")]
    DuplicateSourceName { name: String },
    #[error("source name '{name}' uses the reserved 'auto-' prefix")]
    ReservedSourceName { name: String },
    #[error("expected {expected} source names, got {got}")]
    NameCountMismatch { expected: usize, got: usize },
    #[error("coupling references an unknown source '{name}'")]
    UnknownSource { name: String },
    #[error("source '{name}' cannot be coupled to itself")]
    SelfCoupling { name: String },
    #[error("source '{child}' has conflicting coupling parents '{first}' and '{second}'")]
    MultipleParents {
        child: String,
        first: String,
        second: String,
    },
    #[error("a coupling edge from '{from}' to '{to}' is already registered")]
    DuplicateCouplingEdge { from: String, to: String },
    #[error("the coupling graph contains a cycle through: {}", .members.join(", "))]
    CouplingCycle { members: Vec<String> },
    #[error("no sources were added to the simulation")]
    EmptySimulation,
    #[error("waveform shape mismatch: expected {expected_rows} x {expected_cols}, got {got_rows} x {got_cols}")]
    WaveformShape {
        expected_rows: usize,
        expected_cols: usize,
        got_rows: usize,
        got_cols: usize,
    },
    #[error("coupled waveform length mismatch: expected {expected}, got {got}")]
    CouplingLength { expected: usize, got: usize },
    #[error("location ({src_idx}, {vertno}) is not present in the source space")]
    LocationOutOfRange { src_idx: usize, vertno: u64 },
    #[error("invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("a forward model is required for the adjustment of SNR")]
    MissingForwardModel,
    #[error("no noise sources were added, so the SNR cannot be adjusted")]
    NoNoiseSources,
    #[error("frequency band limits are required for the adjustment of SNR")]
    SnrBandRequired,
    #[error("the noise variance is zero, so the current SNR cannot be computed")]
    ZeroNoiseVariance,
    #[error("the signal variance is zero, so the SNR cannot be adjusted")]
    ZeroSignalVariance,
    #[error("the forward model does not cover the simulated vertex ({src_idx}, {vertno})")]
    UnknownVertex { src_idx: usize, vertno: u64 },
    #[error("filter design failed: {reason}")]
    FilterDesign { reason: String },
    #[error("{label} must not be empty for this computation")]
    EmptyInput { label: &'static str },
}
