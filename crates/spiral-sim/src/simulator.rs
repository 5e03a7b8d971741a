//! Builder surface and simulation driver.
//!
//! `SourceSimulator` is the mutable registry: sources and coupling edges are
//! added during the builder phase without any computation. `simulate`
//! resolves the coupling graph, generates waveforms in dependency order,
//! normalises them, applies SNR adjustments, and packages everything into an
//! immutable [`SourceConfiguration`].

use crate::configuration::SourceConfiguration;
use crate::coupling::Coupling;
use crate::determinism;
use crate::dsp::Band;
use crate::error::{SimResult, SimulationError};
use crate::forward::ForwardOperator;
use crate::graph::{resolve_generation_order, CouplingEdge, GenerationStep};
use crate::snr::{self, LocalSnrTarget};
use crate::source::{Location, LocationSpec, SimulatedSource, SourceRole, SourceSpace};
use crate::waveform::{sample_std, times_for, Waveform};
use ndarray::Array1;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Probe parameters used to validate custom callables at registration time,
/// mirroring the simulate-time call shape without touching the caller's seed.
const PROBE_SFREQ: f64 = 1000.0;
const PROBE_DURATION: f64 = 1.0;

/// Specification of a group of point sources.
#[derive(Debug, Clone)]
pub struct PointSources {
    location: LocationSpec,
    waveform: Waveform,
    stds: Option<Vec<f64>>,
    snr: Option<Vec<f64>>,
    snr_band: Option<Band>,
    names: Option<Vec<String>>,
}

impl PointSources {
    pub fn new(location: LocationSpec, waveform: Waveform) -> Self {
        Self {
            location,
            waveform,
            stds: None,
            snr: None,
            snr_band: None,
            names: None,
        }
    }

    /// Explicit names, one per source.
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// One target standard deviation applied to every source of the group.
    pub fn with_std(mut self, std: f64) -> Self {
        self.stds = Some(vec![std]);
        self
    }

    /// Per-source target standard deviations.
    pub fn with_stds(mut self, stds: Vec<f64>) -> Self {
        self.stds = Some(stds);
        self
    }

    /// One local SNR target (amplitude SNR) for every source, evaluated in
    /// the given frequency band.
    pub fn with_snr(mut self, snr: f64, band: Band) -> Self {
        self.snr = Some(vec![snr]);
        self.snr_band = Some(band);
        self
    }

    /// Per-source local SNR targets.
    pub fn with_snrs(mut self, snr: Vec<f64>, band: Band) -> Self {
        self.snr = Some(snr);
        self.snr_band = Some(band);
        self
    }
}

/// Specification of a group of patch sources: each patch propagates one
/// waveform over its vertices.
#[derive(Debug, Clone)]
pub struct PatchSources {
    patches: Vec<Vec<Location>>,
    waveform: Waveform,
    stds: Option<Vec<f64>>,
    vertex_stds: Option<Vec<Vec<f64>>>,
    snr: Option<Vec<f64>>,
    snr_band: Option<Band>,
    names: Option<Vec<String>>,
}

impl PatchSources {
    pub fn new(patches: Vec<Vec<Location>>, waveform: Waveform) -> Self {
        Self {
            patches,
            waveform,
            stds: None,
            vertex_stds: None,
            snr: None,
            snr_band: None,
            names: None,
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_std(mut self, std: f64) -> Self {
        self.stds = Some(vec![std]);
        self
    }

    pub fn with_stds(mut self, stds: Vec<f64>) -> Self {
        self.stds = Some(stds);
        self
    }

    /// Spatial standard-deviation map: one value per vertex of each patch.
    /// Mutually exclusive with the scalar std.
    pub fn with_vertex_stds(mut self, vertex_stds: Vec<Vec<f64>>) -> Self {
        self.vertex_stds = Some(vertex_stds);
        self
    }

    pub fn with_snr(mut self, snr: f64, band: Band) -> Self {
        self.snr = Some(vec![snr]);
        self.snr_band = Some(band);
        self
    }

    pub fn with_snrs(mut self, snr: Vec<f64>, band: Band) -> Self {
        self.snr = Some(snr);
        self.snr_band = Some(band);
        self
    }
}

/// Specification of a group of noise sources. Noise sources take part in SNR
/// computations as the reference power; their waveform defaults to 1/f noise.
#[derive(Debug, Clone)]
pub struct NoiseSources {
    location: LocationSpec,
    waveform: Waveform,
    stds: Option<Vec<f64>>,
}

impl NoiseSources {
    pub fn new(location: LocationSpec) -> Self {
        Self {
            location,
            waveform: Waveform::one_over_f(),
            stds: None,
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    pub fn with_std(mut self, std: f64) -> Self {
        self.stds = Some(vec![std]);
        self
    }
}

/// Per-group location handling.
#[derive(Debug, Clone)]
enum GroupLocation {
    /// One vertex per source, resolved at simulate time.
    PerSource(LocationSpec),
    /// Fixed vertex lists, one per patch source.
    Patches(Vec<Vec<Location>>),
}

#[derive(Debug, Clone)]
struct SourceGroup {
    role: SourceRole,
    location: GroupLocation,
    waveform: Waveform,
    names: Vec<String>,
    /// Per-source std override; `None` keeps the base unit (generated) or
    /// the raw data (fixed arrays).
    stds: Vec<Option<f64>>,
    /// Per-source spatial std map (patches only).
    vertex_stds: Vec<Option<Vec<f64>>>,
    snr: Vec<Option<LocalSnrTarget>>,
}

impl SourceGroup {
    fn n_sources(&self) -> usize {
        self.names.len()
    }
}

/// Mutable registry of sources and coupling constraints.
///
/// All `add_*` methods validate their input and either commit it as a whole
/// or leave the registry untouched.
#[derive(Debug, Clone)]
pub struct SourceSimulator {
    src: SourceSpace,
    groups: Vec<SourceGroup>,
    edges: Vec<CouplingEdge>,
    names: Vec<String>,
    name_set: HashSet<String>,
    n_signal_groups: usize,
    n_noise_groups: usize,
    base_std: f64,
}

impl SourceSimulator {
    pub fn new(src: SourceSpace) -> Self {
        Self {
            src,
            groups: Vec::new(),
            edges: Vec::new(),
            names: Vec::new(),
            name_set: HashSet::new(),
            n_signal_groups: 0,
            n_noise_groups: 0,
            base_std: 1.0,
        }
    }

    /// Overrides the base standard deviation that generated waveforms are
    /// normalised to when no per-source or per-vertex value is given.
    pub fn set_base_std(&mut self, base_std: f64) -> SimResult<()> {
        if !(base_std.is_finite() && base_std > 0.0) {
            return Err(SimulationError::InvalidParameter {
                name: "base_std",
                reason: format!("expected a positive finite value, got {base_std}"),
            });
        }
        self.base_std = base_std;
        Ok(())
    }

    /// Adds point sources of brain activity. Returns the (provided or
    /// auto-generated) source names.
    pub fn add_point_sources(&mut self, spec: PointSources) -> SimResult<Vec<String>> {
        spec.waveform.validate()?;
        let n_sources = self.check_location(&spec.location)?;
        self.check_waveform_data(&spec.waveform, n_sources)?;

        let group_tag = format!("sg{}", self.n_signal_groups);
        let names = self.check_names(spec.names, &group_tag, n_sources)?;
        let stds = broadcast_stds(spec.stds, n_sources)?;
        let snr = broadcast_snr(spec.snr, spec.snr_band, n_sources)?;

        let group = SourceGroup {
            role: SourceRole::Signal,
            location: GroupLocation::PerSource(spec.location),
            waveform: spec.waveform,
            names: names.clone(),
            stds,
            vertex_stds: vec![None; n_sources],
            snr,
        };
        self.commit(group);
        self.n_signal_groups += 1;
        Ok(names)
    }

    /// Adds patch sources: one waveform propagated over each patch's
    /// vertices.
    pub fn add_patch_sources(&mut self, spec: PatchSources) -> SimResult<Vec<String>> {
        spec.waveform.validate()?;
        let n_sources = spec.patches.len();
        if n_sources == 0 {
            return Err(SimulationError::EmptyInput { label: "patches" });
        }
        for patch in &spec.patches {
            if patch.is_empty() {
                return Err(SimulationError::EmptyInput { label: "patch" });
            }
            for &(src_idx, vertno) in patch {
                if !self.src.contains((src_idx, vertno)) {
                    return Err(SimulationError::LocationOutOfRange { src_idx, vertno });
                }
            }
        }
        self.check_waveform_data(&spec.waveform, n_sources)?;

        let group_tag = format!("sg{}", self.n_signal_groups);
        let names = self.check_names(spec.names, &group_tag, n_sources)?;
        let stds = broadcast_stds(spec.stds, n_sources)?;
        let vertex_stds = check_vertex_stds(spec.vertex_stds, &spec.patches, &stds)?;
        let snr = broadcast_snr(spec.snr, spec.snr_band, n_sources)?;

        let group = SourceGroup {
            role: SourceRole::Signal,
            location: GroupLocation::Patches(spec.patches),
            waveform: spec.waveform,
            names: names.clone(),
            stds,
            vertex_stds,
            snr,
        };
        self.commit(group);
        self.n_signal_groups += 1;
        Ok(names)
    }

    /// Adds noise sources used as the reference power for SNR adjustments.
    pub fn add_noise_sources(&mut self, spec: NoiseSources) -> SimResult<Vec<String>> {
        spec.waveform.validate()?;
        let n_sources = self.check_location(&spec.location)?;
        self.check_waveform_data(&spec.waveform, n_sources)?;

        let group_tag = format!("ng{}", self.n_noise_groups);
        let names = self.check_names(None, &group_tag, n_sources)?;
        let stds = broadcast_stds(spec.stds, n_sources)?;

        let group = SourceGroup {
            role: SourceRole::Noise,
            location: GroupLocation::PerSource(spec.location),
            waveform: spec.waveform,
            names: names.clone(),
            stds,
            vertex_stds: vec![None; n_sources],
            snr: vec![None; n_sources],
        };
        self.commit(group);
        self.n_noise_groups += 1;
        Ok(names)
    }

    /// Registers coupling edges `(parent, child, method)`. The whole batch is
    /// validated against the registry and the already-registered edges before
    /// any of it is committed.
    pub fn set_coupling<I, S>(&mut self, edges: I) -> SimResult<()>
    where
        I: IntoIterator<Item = (S, S, Coupling)>,
        S: Into<String>,
    {
        let mut parents: HashMap<String, String> = self
            .edges
            .iter()
            .map(|edge| (edge.to.clone(), edge.from.clone()))
            .collect();
        let mut seen_pairs: HashSet<(String, String)> = self
            .edges
            .iter()
            .map(|edge| (edge.from.clone(), edge.to.clone()))
            .collect();

        let mut batch = Vec::new();
        for (from, to, method) in edges {
            let (from, to) = (from.into(), to.into());
            method.validate()?;
            for name in [&from, &to] {
                if !self.name_set.contains(name.as_str()) {
                    return Err(SimulationError::UnknownSource { name: name.clone() });
                }
            }
            if from == to {
                return Err(SimulationError::SelfCoupling { name: to });
            }
            if !seen_pairs.insert((from.clone(), to.clone())) {
                return Err(SimulationError::DuplicateCouplingEdge { from, to });
            }
            if let Some(existing) = parents.insert(to.clone(), from.clone()) {
                return Err(SimulationError::MultipleParents {
                    child: to,
                    first: existing,
                    second: from,
                });
            }
            batch.push(CouplingEdge { from, to, method });
        }
        self.edges.extend(batch);
        Ok(())
    }

    /// All registered source names, in registration order.
    pub fn source_names(&self) -> &[String] {
        &self.names
    }

    /// Simulates one configuration of the registered sources.
    ///
    /// `forward` is only required when any SNR adjustment is requested;
    /// `snr_global`/`snr_band` control the global adjustment; `random_state`
    /// makes the configuration reproducible.
    pub fn simulate(
        &self,
        sfreq: f64,
        duration: f64,
        forward: Option<&dyn ForwardOperator>,
        snr_global: Option<f64>,
        snr_band: Option<Band>,
        random_state: Option<u64>,
    ) -> SimResult<SourceConfiguration> {
        if !(sfreq.is_finite() && sfreq > 0.0) {
            return Err(SimulationError::InvalidParameter {
                name: "sfreq",
                reason: format!("expected a positive sampling frequency, got {sfreq}"),
            });
        }
        if !(duration.is_finite() && duration > 0.0) {
            return Err(SimulationError::InvalidParameter {
                name: "duration",
                reason: format!("expected a positive duration, got {duration}"),
            });
        }
        if self.groups.is_empty() {
            return Err(SimulationError::EmptySimulation);
        }

        let wants_local_snr = self
            .groups
            .iter()
            .any(|group| group.snr.iter().any(Option::is_some));
        let wants_snr = wants_local_snr || snr_global.is_some();
        if wants_snr && forward.is_none() {
            return Err(SimulationError::MissingForwardModel);
        }
        if snr_global.is_some() && snr_band.is_none() {
            return Err(SimulationError::SnrBandRequired);
        }
        if let Some(target) = snr_global {
            if !(target.is_finite() && target > 0.0) {
                return Err(SimulationError::InvalidParameter {
                    name: "snr_global",
                    reason: format!("expected a positive ratio, got {target}"),
                });
            }
        }

        let base_seed = determinism::resolve_base_seed(random_state);
        let times = times_for(sfreq, duration);
        let n_times = times.len();
        if n_times < 2 {
            return Err(SimulationError::InvalidParameter {
                name: "duration",
                reason: "the requested duration yields fewer than two samples".into(),
            });
        }

        // Step 1: fail fast on an invalid coupling structure.
        let order = resolve_generation_order(&self.names, &self.edges)?;
        debug!(
            n_sources = order.len(),
            n_edges = self.edges.len(),
            "resolved generation order"
        );

        // Resolve group locations; the draw is keyed by the group's names so
        // unrelated groups never share a random stream.
        let defs = self.resolve_source_defs(base_seed, n_times)?;

        // Steps 2-3: generate every waveform in dependency order, each source
        // drawing from its own name-derived stream.
        let mut waveforms: HashMap<&str, Array1<f64>> = HashMap::with_capacity(defs.len());
        for step in &order {
            let def = &defs[step.name()];
            let mut rng =
                determinism::rng_for(base_seed, &format!("waveform:{}", step.name()));
            let data = match step {
                GenerationStep::Independent { .. } => match &def.fixed_row {
                    Some(row) => row.clone(),
                    None => def
                        .waveform
                        .generate(1, &times, &mut rng)?
                        .row(0)
                        .to_owned(),
                },
                GenerationStep::Coupled {
                    parent, edge_index, ..
                } => {
                    let parent_wave = waveforms
                        .get(parent.as_str())
                        .expect("parents precede children in generation order");
                    self.edges[*edge_index]
                        .method
                        .couple(parent_wave, sfreq, &mut rng)?
                }
            };
            waveforms.insert(def.name.as_str(), data);
        }

        // Step 4: rescale to the per-source target standard deviation.
        let mut signal_sources = Vec::new();
        let mut noise_sources = Vec::new();
        let mut local_targets = Vec::new();
        for name in &self.names {
            let def = &defs[name];
            let mut waveform = waveforms.remove(name.as_str()).expect("generated above");
            if let Some(target_std) = def.normalization_target(self.base_std) {
                let std = sample_std(waveform.as_slice().expect("contiguous waveform"));
                if std <= f64::EPSILON {
                    return Err(SimulationError::InvalidParameter {
                        name: "waveform",
                        reason: format!(
                            "the waveform of source '{name}' has zero variance and cannot be normalised"
                        ),
                    });
                }
                waveform.mapv_inplace(|v| v / std * target_std);
            }

            let simulated = SimulatedSource {
                name: def.name.clone(),
                role: def.role,
                locations: def.locations.clone(),
                vertex_scales: def.vertex_scales.clone(),
                waveform,
            };
            match def.role {
                SourceRole::Signal => {
                    if let Some(target) = def.snr {
                        local_targets.push((signal_sources.len(), target));
                    }
                    signal_sources.push(simulated);
                }
                SourceRole::Noise => noise_sources.push(simulated),
            }
        }

        // Steps 5-6: SNR adjustments against the pooled noise power.
        if let Some(forward) = forward {
            snr::adjust_snr_local(
                forward,
                sfreq,
                n_times,
                &mut signal_sources,
                &local_targets,
                &noise_sources,
            )?;
            if let Some(target) = snr_global {
                snr::adjust_snr_global(
                    forward,
                    sfreq,
                    n_times,
                    &mut signal_sources,
                    target,
                    snr_band.expect("checked above"),
                    &noise_sources,
                )?;
            }
        }

        Ok(SourceConfiguration::new(
            sfreq,
            duration,
            times,
            base_seed,
            random_state,
            signal_sources,
            noise_sources,
        ))
    }

    /// Resolves group locations into per-source records.
    fn resolve_source_defs(
        &self,
        base_seed: u64,
        n_times: usize,
    ) -> SimResult<HashMap<String, SourceDef>> {
        let mut defs = HashMap::with_capacity(self.names.len());
        for group in &self.groups {
            let per_source_locations: Vec<Vec<Location>> = match &group.location {
                GroupLocation::Patches(patches) => patches.clone(),
                GroupLocation::PerSource(spec) => {
                    let label = format!("location:{}", group.names.join(","));
                    let mut rng = determinism::rng_for(base_seed, &label);
                    let locations = spec.resolve(&self.src, &mut rng)?;
                    if locations.len() != group.n_sources() {
                        return Err(SimulationError::InvalidParameter {
                            name: "location",
                            reason: format!(
                                "the location function returned {} locations, expected {}",
                                locations.len(),
                                group.n_sources()
                            ),
                        });
                    }
                    locations.into_iter().map(|l| vec![l]).collect()
                }
            };

            for (i, name) in group.names.iter().enumerate() {
                let locations = per_source_locations[i].clone();
                let (vertex_scales, normalize_override) = match &group.vertex_stds[i] {
                    Some(map) => (map.clone(), Some(1.0)),
                    None => (vec![1.0; locations.len()], group.stds[i]),
                };
                let fixed_row = match &group.waveform {
                    Waveform::Fixed(data) => {
                        if data.ncols() != n_times {
                            return Err(SimulationError::WaveformShape {
                                expected_rows: group.n_sources(),
                                expected_cols: n_times,
                                got_rows: data.nrows(),
                                got_cols: data.ncols(),
                            });
                        }
                        Some(data.row(i).to_owned())
                    }
                    _ => None,
                };
                defs.insert(
                    name.clone(),
                    SourceDef {
                        name: name.clone(),
                        role: group.role,
                        locations,
                        vertex_scales,
                        waveform: group.waveform.clone(),
                        is_fixed: fixed_row.is_some(),
                        fixed_row,
                        std: normalize_override,
                        snr: group.snr[i],
                    },
                );
            }
        }
        Ok(defs)
    }

    /// Validates a location spec and returns the number of sources it will
    /// produce. Custom selectors are probed with a fixed registration-time
    /// seed, mirroring the simulate-time call.
    fn check_location(&self, spec: &LocationSpec) -> SimResult<usize> {
        match spec.known_len() {
            Some(0) => Err(SimulationError::EmptyInput { label: "location" }),
            Some(n) => {
                // Validate what can be validated without drawing.
                match spec {
                    LocationSpec::Vertices(locations) => {
                        for &(src_idx, vertno) in locations {
                            if !self.src.contains((src_idx, vertno)) {
                                return Err(SimulationError::LocationOutOfRange {
                                    src_idx,
                                    vertno,
                                });
                            }
                        }
                    }
                    LocationSpec::RandomVertices { n } => {
                        if *n > self.src.n_vertices() {
                            return Err(SimulationError::InvalidParameter {
                                name: "n",
                                reason: format!(
                                    "requested {n} random locations from a source space with {} vertices",
                                    self.src.n_vertices()
                                ),
                            });
                        }
                    }
                    LocationSpec::Custom(_) => unreachable!("custom specs have no known length"),
                }
                Ok(n)
            }
            None => {
                let mut rng = determinism::rng_for(0, "location-probe");
                let locations = spec.resolve(&self.src, &mut rng)?;
                if locations.is_empty() {
                    return Err(SimulationError::EmptyInput { label: "location" });
                }
                Ok(locations.len())
            }
        }
    }

    /// Validates waveform data against the group size. Custom generators are
    /// probed with a fixed registration-time seed and checked for shape.
    fn check_waveform_data(&self, waveform: &Waveform, n_sources: usize) -> SimResult<()> {
        match waveform {
            Waveform::Fixed(data) => {
                if data.nrows() != n_sources {
                    return Err(SimulationError::WaveformShape {
                        expected_rows: n_sources,
                        expected_cols: data.ncols(),
                        got_rows: data.nrows(),
                        got_cols: data.ncols(),
                    });
                }
                Ok(())
            }
            Waveform::Custom(_) => {
                let probe_times = times_for(PROBE_SFREQ, PROBE_DURATION);
                let mut rng = determinism::rng_for(0, "waveform-probe");
                waveform.generate(n_sources, &probe_times, &mut rng).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Validates user names or auto-generates `auto-<group>-s<idx>` ones.
    fn check_names(
        &self,
        names: Option<Vec<String>>,
        group_tag: &str,
        n_sources: usize,
    ) -> SimResult<Vec<String>> {
        let names = match names {
            None => (0..n_sources)
                .map(|i| format!("auto-{group_tag}-s{i}"))
                .collect::<Vec<_>>(),
            Some(names) => {
                if names.len() != n_sources {
                    return Err(SimulationError::NameCountMismatch {
                        expected: n_sources,
                        got: names.len(),
                    });
                }
                for name in &names {
                    if name.is_empty() {
                        return Err(SimulationError::InvalidParameter {
                            name: "names",
                            reason: "source names must not be empty".into(),
                        });
                    }
                    if name.starts_with("auto-") {
                        return Err(SimulationError::ReservedSourceName { name: name.clone() });
                    }
                }
                names
            }
        };
        let mut batch = HashSet::new();
        for name in &names {
            if self.name_set.contains(name) || !batch.insert(name.clone()) {
                return Err(SimulationError::DuplicateSourceName { name: name.clone() });
            }
        }
        Ok(names)
    }

    fn commit(&mut self, group: SourceGroup) {
        for name in &group.names {
            self.names.push(name.clone());
            self.name_set.insert(name.clone());
        }
        self.groups.push(group);
    }
}

/// Per-source record assembled at simulate time.
#[derive(Debug, Clone)]
struct SourceDef {
    name: String,
    role: SourceRole,
    locations: Vec<Location>,
    vertex_scales: Vec<f64>,
    waveform: Waveform,
    is_fixed: bool,
    fixed_row: Option<Array1<f64>>,
    std: Option<f64>,
    snr: Option<LocalSnrTarget>,
}

impl SourceDef {
    /// Target standard deviation the driver should normalise to, or `None`
    /// to leave the data untouched (fixed arrays without an override).
    fn normalization_target(&self, base_std: f64) -> Option<f64> {
        if self.is_fixed {
            self.std
        } else {
            Some(self.std.unwrap_or(base_std))
        }
    }
}

fn broadcast_stds(stds: Option<Vec<f64>>, n_sources: usize) -> SimResult<Vec<Option<f64>>> {
    match stds {
        None => Ok(vec![None; n_sources]),
        Some(values) => {
            let values = broadcast(values, n_sources, "std")?;
            for &value in &values {
                if !(value.is_finite() && value > 0.0) {
                    return Err(SimulationError::InvalidParameter {
                        name: "std",
                        reason: format!("expected a positive finite value, got {value}"),
                    });
                }
            }
            Ok(values.into_iter().map(Some).collect())
        }
    }
}

fn broadcast_snr(
    snr: Option<Vec<f64>>,
    band: Option<Band>,
    n_sources: usize,
) -> SimResult<Vec<Option<LocalSnrTarget>>> {
    match snr {
        None => Ok(vec![None; n_sources]),
        Some(values) => {
            let band = band.ok_or(SimulationError::SnrBandRequired)?;
            Band::new(band.fmin, band.fmax)?;
            let values = broadcast(values, n_sources, "snr")?;
            for &value in &values {
                if !(value.is_finite() && value >= 0.0) {
                    return Err(SimulationError::InvalidParameter {
                        name: "snr",
                        reason: format!("expected a non-negative finite value, got {value}"),
                    });
                }
            }
            Ok(values
                .into_iter()
                .map(|snr| Some(LocalSnrTarget { snr, band }))
                .collect())
        }
    }
}

/// Broadcasts a single value to the group size, or checks the length.
fn broadcast(values: Vec<f64>, n_sources: usize, name: &'static str) -> SimResult<Vec<f64>> {
    if values.len() == 1 {
        return Ok(vec![values[0]; n_sources]);
    }
    if values.len() != n_sources {
        return Err(SimulationError::InvalidParameter {
            name,
            reason: format!(
                "expected 1 or {n_sources} values, got {}",
                values.len()
            ),
        });
    }
    Ok(values)
}

fn check_vertex_stds(
    vertex_stds: Option<Vec<Vec<f64>>>,
    patches: &[Vec<Location>],
    stds: &[Option<f64>],
) -> SimResult<Vec<Option<Vec<f64>>>> {
    match vertex_stds {
        None => Ok(vec![None; patches.len()]),
        Some(maps) => {
            if stds.iter().any(Option::is_some) {
                return Err(SimulationError::InvalidParameter {
                    name: "vertex_stds",
                    reason: "scalar and per-vertex standard deviations are mutually exclusive"
                        .into(),
                });
            }
            if maps.len() != patches.len() {
                return Err(SimulationError::InvalidParameter {
                    name: "vertex_stds",
                    reason: format!(
                        "expected {} per-patch maps, got {}",
                        patches.len(),
                        maps.len()
                    ),
                });
            }
            for (map, patch) in maps.iter().zip(patches.iter()) {
                if map.len() != patch.len() {
                    return Err(SimulationError::InvalidParameter {
                        name: "vertex_stds",
                        reason: format!(
                            "a patch with {} vertices received {} std values",
                            patch.len(),
                            map.len()
                        ),
                    });
                }
                for &value in map {
                    if !(value.is_finite() && value > 0.0) {
                        return Err(SimulationError::InvalidParameter {
                            name: "vertex_stds",
                            reason: format!("expected positive finite values, got {value}"),
                        });
                    }
                }
            }
            Ok(maps.into_iter().map(Some).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn simulator() -> SourceSimulator {
        SourceSimulator::new(SourceSpace::single(16).unwrap())
    }

    #[test]
    fn auto_names_follow_group_numbering() {
        let mut sim = simulator();
        let first = sim
            .add_point_sources(PointSources::new(
                LocationSpec::Vertices(vec![(0, 0), (0, 1)]),
                Waveform::WhiteNoise,
            ))
            .unwrap();
        let noise = sim
            .add_noise_sources(NoiseSources::new(LocationSpec::Vertices(vec![(0, 2)])))
            .unwrap();
        let second = sim
            .add_point_sources(PointSources::new(
                LocationSpec::Vertices(vec![(0, 3)]),
                Waveform::WhiteNoise,
            ))
            .unwrap();
        assert_eq!(first, vec!["auto-sg0-s0", "auto-sg0-s1"]);
        assert_eq!(noise, vec!["auto-ng0-s0"]);
        assert_eq!(second, vec!["auto-sg1-s0"]);
    }

    #[test]
    fn duplicate_names_abort_without_touching_the_registry() {
        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 0)]), Waveform::WhiteNoise)
                .with_names(["s1"]),
        )
        .unwrap();
        let err = sim
            .add_point_sources(
                PointSources::new(
                    LocationSpec::Vertices(vec![(0, 1), (0, 2)]),
                    Waveform::WhiteNoise,
                )
                .with_names(["s2", "s1"]),
            )
            .unwrap_err();
        assert_eq!(err, SimulationError::DuplicateSourceName { name: "s1".into() });
        assert_eq!(sim.source_names(), &["s1".to_string()]);
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let mut sim = simulator();
        let err = sim
            .add_point_sources(
                PointSources::new(LocationSpec::Vertices(vec![(0, 0)]), Waveform::WhiteNoise)
                    .with_names(["auto-sg0-s0"]),
            )
            .unwrap_err();
        assert!(matches!(err, SimulationError::ReservedSourceName { .. }));
    }

    #[test]
    fn coupling_to_unregistered_sources_fails_at_registration() {
        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 0)]), Waveform::WhiteNoise)
                .with_names(["s1"]),
        )
        .unwrap();
        let err = sim
            .set_coupling([("s1", "ghost", Coupling::ConstantPhaseShift { phase_lag: 0.1 })])
            .unwrap_err();
        assert_eq!(err, SimulationError::UnknownSource { name: "ghost".into() });
        // The registry is untouched, so registering the edge later works.
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 1)]), Waveform::WhiteNoise)
                .with_names(["ghost"]),
        )
        .unwrap();
        sim.set_coupling([("s1", "ghost", Coupling::ConstantPhaseShift { phase_lag: 0.1 })])
            .unwrap();
    }

    #[test]
    fn fan_in_is_rejected_across_set_coupling_calls() {
        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(
                LocationSpec::Vertices(vec![(0, 0), (0, 1), (0, 2)]),
                Waveform::narrowband_alpha(),
            )
            .with_names(["a", "b", "c"]),
        )
        .unwrap();
        sim.set_coupling([("a", "c", Coupling::ConstantPhaseShift { phase_lag: 0.1 })])
            .unwrap();
        let err = sim
            .set_coupling([("b", "c", Coupling::ConstantPhaseShift { phase_lag: 0.2 })])
            .unwrap_err();
        assert_eq!(
            err,
            SimulationError::MultipleParents {
                child: "c".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn self_coupling_is_rejected_at_registration() {
        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 0)]), Waveform::WhiteNoise)
                .with_names(["s1"]),
        )
        .unwrap();
        let err = sim
            .set_coupling([("s1", "s1", Coupling::ConstantPhaseShift { phase_lag: 0.0 })])
            .unwrap_err();
        assert_eq!(err, SimulationError::SelfCoupling { name: "s1".into() });
    }

    #[test]
    fn snr_without_forward_model_fails_before_generation() {
        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 0)]), Waveform::narrowband_alpha())
                .with_snr(2.0, Band { fmin: 8.0, fmax: 12.0 }),
        )
        .unwrap();
        sim.add_noise_sources(NoiseSources::new(LocationSpec::Vertices(vec![(0, 1)])))
            .unwrap();
        let err = sim
            .simulate(100.0, 2.0, None, None, None, Some(0))
            .unwrap_err();
        assert_eq!(err, SimulationError::MissingForwardModel);
    }

    #[test]
    fn empty_registry_cannot_be_simulated() {
        let sim = simulator();
        assert_eq!(
            sim.simulate(100.0, 1.0, None, None, None, Some(0)).unwrap_err(),
            SimulationError::EmptySimulation
        );
    }

    #[test]
    fn fixed_waveforms_keep_their_scale_unless_overridden() {
        let mut sim = simulator();
        let data = Array2::from_shape_fn((1, 200), |(_, j)| (j as f64 * 0.3).sin() * 4.0);
        sim.add_point_sources(
            PointSources::new(
                LocationSpec::Vertices(vec![(0, 0)]),
                Waveform::Fixed(data.clone()),
            )
            .with_names(["fixed"]),
        )
        .unwrap();
        let config = sim.simulate(100.0, 2.0, None, None, None, Some(1)).unwrap();
        let waveform = config.waveform("fixed").unwrap();
        assert_eq!(waveform, &data.row(0).to_owned());

        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 0)]), Waveform::Fixed(data))
                .with_names(["fixed"])
                .with_std(2.0),
        )
        .unwrap();
        let config = sim.simulate(100.0, 2.0, None, None, None, Some(1)).unwrap();
        let std = sample_std(config.waveform("fixed").unwrap().as_slice().unwrap());
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn base_std_override_applies_to_unspecified_sources() {
        let mut sim = simulator();
        sim.set_base_std(3.0).unwrap();
        sim.add_point_sources(
            PointSources::new(
                LocationSpec::Vertices(vec![(0, 0), (0, 1)]),
                Waveform::WhiteNoise,
            )
            .with_names(["plain", "scaled"])
            .with_stds(vec![3.0, 0.5]),
        )
        .unwrap();
        sim.add_point_sources(
            PointSources::new(LocationSpec::Vertices(vec![(0, 2)]), Waveform::WhiteNoise)
                .with_names(["default"]),
        )
        .unwrap();
        let config = sim.simulate(250.0, 2.0, None, None, None, Some(5)).unwrap();

        let std_of = |name: &str| {
            sample_std(config.waveform(name).unwrap().as_slice().unwrap())
        };
        assert!((std_of("default") - 3.0).abs() < 1e-9);
        assert!((std_of("scaled") - 0.5).abs() < 1e-9);
        assert!(sim.set_base_std(-1.0).is_err());
    }

    #[test]
    fn patch_sources_propagate_one_waveform_per_vertex() {
        let mut sim = simulator();
        sim.add_patch_sources(
            PatchSources::new(
                vec![vec![(0, 0), (0, 1), (0, 2)]],
                Waveform::narrowband_alpha(),
            )
            .with_names(["patch"])
            .with_vertex_stds(vec![vec![1.0, 2.0, 4.0]]),
        )
        .unwrap();
        let config = sim.simulate(250.0, 2.0, None, None, None, Some(0)).unwrap();

        let source = config.source("patch").unwrap();
        assert_eq!(source.locations().len(), 3);

        let activation = config.to_source_activation().unwrap();
        assert_eq!(activation.n_vertices(), 3);
        // Every vertex carries the same waveform scaled by its std value.
        let base = activation.data.row(0).to_owned();
        assert_eq!(activation.data.row(1).to_owned(), &base * 2.0);
        assert_eq!(activation.data.row(2).to_owned(), &base * 4.0);
    }

    #[test]
    fn scalar_and_vertex_stds_are_mutually_exclusive() {
        let mut sim = simulator();
        let err = sim
            .add_patch_sources(
                PatchSources::new(vec![vec![(0, 0), (0, 1)]], Waveform::narrowband_alpha())
                    .with_std(2.0)
                    .with_vertex_stds(vec![vec![1.0, 2.0]]),
            )
            .unwrap_err();
        assert!(matches!(err, SimulationError::InvalidParameter { .. }));
    }

    #[test]
    fn fixed_waveform_length_is_checked_at_simulate_time() {
        let mut sim = simulator();
        sim.add_point_sources(
            PointSources::new(
                LocationSpec::Vertices(vec![(0, 0)]),
                Waveform::Fixed(Array2::ones((1, 100))),
            )
            .with_names(["fixed"]),
        )
        .unwrap();
        let err = sim.simulate(100.0, 2.0, None, None, None, Some(0)).unwrap_err();
        assert!(matches!(err, SimulationError::WaveformShape { .. }));
    }
}
