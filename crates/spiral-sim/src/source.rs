//! Source-space addressing and realized sources.
//!
//! The anatomical source space is opaque to the engine: it only exposes which
//! vertex ids exist in which source space (e.g. hemisphere). Geometry, patch
//! growing, and visualization live with external collaborators.

use crate::error::{SimResult, SimulationError};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Address of a candidate source location: (source-space index, vertex id).
pub type Location = (usize, u64);

/// Opaque holder of candidate source locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpace {
    spaces: Vec<Vec<u64>>,
}

impl SourceSpace {
    /// Builds a source space from per-space vertex id lists.
    pub fn new(spaces: Vec<Vec<u64>>) -> SimResult<Self> {
        if spaces.iter().all(|vertices| vertices.is_empty()) {
            return Err(SimulationError::EmptyInput {
                label: "source space",
            });
        }
        Ok(Self { spaces })
    }

    /// A single flat source space with vertex ids `0..n`.
    pub fn single(n_vertices: u64) -> SimResult<Self> {
        Self::new(vec![(0..n_vertices).collect()])
    }

    pub fn n_spaces(&self) -> usize {
        self.spaces.len()
    }

    pub fn n_vertices(&self) -> usize {
        self.spaces.iter().map(|vertices| vertices.len()).sum()
    }

    pub fn contains(&self, location: Location) -> bool {
        let (src_idx, vertno) = location;
        self.spaces
            .get(src_idx)
            .map(|vertices| vertices.contains(&vertno))
            .unwrap_or(false)
    }

    /// All candidate locations in canonical (space, vertex) order.
    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.spaces
            .iter()
            .enumerate()
            .flat_map(|(src_idx, vertices)| vertices.iter().map(move |&v| (src_idx, v)))
    }
}

/// Structural contract for user-supplied location selectors:
/// `(source space, rng) -> locations`. The result is validated against the
/// source space by the caller.
pub type LocationFn = Arc<dyn Fn(&SourceSpace, &mut StdRng) -> Vec<Location> + Send + Sync>;

/// Location specification of a source group.
#[derive(Clone)]
pub enum LocationSpec {
    /// Explicit list of locations, fixed across configurations.
    Vertices(Vec<Location>),
    /// `n` distinct locations drawn uniformly per configuration.
    RandomVertices { n: usize },
    /// User-supplied selector function.
    Custom(LocationFn),
}

impl fmt::Debug for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationSpec::Vertices(locations) => {
                f.debug_tuple("Vertices").field(locations).finish()
            }
            LocationSpec::RandomVertices { n } => {
                f.debug_struct("RandomVertices").field("n", n).finish()
            }
            LocationSpec::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl LocationSpec {
    /// Number of sources this spec will produce, when it is known without
    /// drawing (explicit lists and `RandomVertices`). Custom selectors are
    /// probed by the builder instead.
    pub(crate) fn known_len(&self) -> Option<usize> {
        match self {
            LocationSpec::Vertices(locations) => Some(locations.len()),
            LocationSpec::RandomVertices { n } => Some(*n),
            LocationSpec::Custom(_) => None,
        }
    }

    /// Resolves the spec into concrete locations, all validated against the
    /// source space.
    pub(crate) fn resolve(
        &self,
        src: &SourceSpace,
        rng: &mut StdRng,
    ) -> SimResult<Vec<Location>> {
        let locations = match self {
            LocationSpec::Vertices(locations) => locations.clone(),
            LocationSpec::RandomVertices { n } => {
                let mut candidates: Vec<Location> = src.locations().collect();
                if *n > candidates.len() {
                    return Err(SimulationError::InvalidParameter {
                        name: "n",
                        reason: format!(
                            "requested {n} random locations from a source space with {} vertices",
                            candidates.len()
                        ),
                    });
                }
                candidates.shuffle(rng);
                candidates.truncate(*n);
                candidates
            }
            LocationSpec::Custom(selector) => selector(src, rng),
        };
        for &(src_idx, vertno) in &locations {
            if !src.contains((src_idx, vertno)) {
                return Err(SimulationError::LocationOutOfRange { src_idx, vertno });
            }
        }
        Ok(locations)
    }
}

/// Role of a source in SNR computations only; generation mechanics do not
/// depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceRole {
    Signal,
    Noise,
}

/// A realized source inside a finished configuration: identity, role,
/// locations (one for point sources, several for patches), the per-vertex
/// amplitude scales, and the generated waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSource {
    pub(crate) name: String,
    pub(crate) role: SourceRole,
    pub(crate) locations: Vec<Location>,
    pub(crate) vertex_scales: Vec<f64>,
    pub(crate) waveform: Array1<f64>,
}

impl SimulatedSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> SourceRole {
        self.role
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn waveform(&self) -> &Array1<f64> {
        &self.waveform
    }
}

/// Stacked activation of a set of sources: one row per distinct location, in
/// ascending location order. Sources sharing a vertex are summed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceActivation {
    pub locations: Vec<Location>,
    pub data: Array2<f64>,
}

impl SourceActivation {
    /// Combines the given sources into a stacked activation.
    pub fn combine<'a>(
        sources: impl IntoIterator<Item = &'a SimulatedSource>,
        n_times: usize,
    ) -> SimResult<Self> {
        let mut rows: BTreeMap<Location, Array1<f64>> = BTreeMap::new();
        for source in sources {
            for (&location, &scale) in source.locations.iter().zip(source.vertex_scales.iter()) {
                let entry = rows
                    .entry(location)
                    .or_insert_with(|| Array1::zeros(n_times));
                entry.scaled_add(scale, &source.waveform);
            }
        }
        if rows.is_empty() {
            return Err(SimulationError::EmptyInput { label: "sources" });
        }

        let locations: Vec<Location> = rows.keys().copied().collect();
        let mut data = Array2::zeros((locations.len(), n_times));
        for (i, row) in rows.values().enumerate() {
            data.row_mut(i).assign(row);
        }
        Ok(Self { locations, data })
    }

    pub fn n_vertices(&self) -> usize {
        self.locations.len()
    }
}
