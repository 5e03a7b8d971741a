//! Forward projection to sensor space.
//!
//! The engine treats the forward model as an opaque linear operator: it maps
//! a stacked source activation to sensor-space time series. The dense
//! implementation below keys gain columns by location so only the simulated
//! vertices take part in each projection.

use crate::error::{SimResult, SimulationError};
use crate::source::{Location, SourceActivation};
use ndarray::Array2;
use std::collections::HashMap;

/// Opaque linear operator from source space to sensor space.
pub trait ForwardOperator {
    fn n_sensors(&self) -> usize;

    /// Projects the activation to `n_sensors x n_times`. Implementations
    /// must fail on vertices they do not cover.
    fn project(&self, activation: &SourceActivation) -> SimResult<Array2<f64>>;
}

/// Dense leadfield: one gain column per known location.
#[derive(Debug, Clone)]
pub struct ForwardModel {
    gain: Array2<f64>,
    columns: HashMap<Location, usize>,
}

impl ForwardModel {
    /// Builds a forward model from a `n_sensors x n_locations` gain matrix
    /// and the location addressed by each column.
    pub fn new(gain: Array2<f64>, locations: Vec<Location>) -> SimResult<Self> {
        if gain.nrows() == 0 {
            return Err(SimulationError::EmptyInput { label: "gain" });
        }
        if gain.ncols() != locations.len() {
            return Err(SimulationError::InvalidParameter {
                name: "locations",
                reason: format!(
                    "gain matrix has {} columns but {} locations were provided",
                    gain.ncols(),
                    locations.len()
                ),
            });
        }
        let mut columns = HashMap::with_capacity(locations.len());
        for (column, location) in locations.into_iter().enumerate() {
            if columns.insert(location, column).is_some() {
                return Err(SimulationError::InvalidParameter {
                    name: "locations",
                    reason: format!(
                        "location ({}, {}) addresses more than one gain column",
                        location.0, location.1
                    ),
                });
            }
        }
        Ok(Self { gain, columns })
    }
}

impl ForwardOperator for ForwardModel {
    fn n_sensors(&self) -> usize {
        self.gain.nrows()
    }

    fn project(&self, activation: &SourceActivation) -> SimResult<Array2<f64>> {
        let mut restricted = Array2::zeros((self.gain.nrows(), activation.n_vertices()));
        for (i, &location) in activation.locations.iter().enumerate() {
            let column = *self.columns.get(&location).ok_or({
                SimulationError::UnknownVertex {
                    src_idx: location.0,
                    vertno: location.1,
                }
            })?;
            restricted.column_mut(i).assign(&self.gain.column(column));
        }
        Ok(restricted.dot(&activation.data))
    }
}
