//! Coupling generators: produce a waveform that is phase coupled to an
//! already-generated parent waveform.
//!
//! All methods share the contract `couple(parent, sfreq, rng) -> child` with
//! the child having the same length as the parent. The phase relationship is
//! imposed on the analytic signal; the amplitude envelope is either reused
//! from the parent or drawn independently, depending on the method.

use crate::dsp::{self, Band};
use crate::error::{SimResult, SimulationError};
use crate::waveform;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// Structural contract for user-supplied coupling functions:
/// `(parent, sfreq, rng) -> child`. Output length is validated by the
/// caller, nothing else is.
pub type CouplingFn = Arc<dyn Fn(&Array1<f64>, f64, &mut StdRng) -> Array1<f64> + Send + Sync>;

/// Amplitude-envelope mode of the probabilistic phase coupling. There is no
/// default on purpose: callers must state which envelope they want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingEnvelope {
    /// Reuse the parent's instantaneous amplitude.
    Parent,
    /// Draw a fresh band-limited amplitude envelope.
    Independent,
}

/// Coupling method attached to a directed edge of the coupling graph.
#[derive(Clone)]
pub enum Coupling {
    /// Deterministic coupling: the child's instantaneous phase equals the
    /// parent's shifted by a fixed lag; the envelope is the parent's.
    ConstantPhaseShift { phase_lag: f64 },
    /// Probabilistic phase coupling: the per-sample phase lag is drawn from a
    /// von Mises distribution centred at `phase_lag` with concentration
    /// `kappa` (`kappa -> inf` approaches the constant shift, `kappa = 0`
    /// destroys the coupling).
    PpcVonMises {
        phase_lag: f64,
        kappa: f64,
        band: Band,
        envelope: CouplingEnvelope,
    },
    /// Mixes the phase-shifted copy of the parent with independent
    /// band-limited noise so that the coherence with the parent approximates
    /// `coherence` in `[0, 1]`.
    ShiftedCopyWithNoise {
        coherence: f64,
        phase_lag: f64,
        band: Band,
    },
    /// User-supplied coupling function.
    Custom(CouplingFn),
}

impl fmt::Debug for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coupling::ConstantPhaseShift { phase_lag } => f
                .debug_struct("ConstantPhaseShift")
                .field("phase_lag", phase_lag)
                .finish(),
            Coupling::PpcVonMises {
                phase_lag,
                kappa,
                band,
                envelope,
            } => f
                .debug_struct("PpcVonMises")
                .field("phase_lag", phase_lag)
                .field("kappa", kappa)
                .field("band", band)
                .field("envelope", envelope)
                .finish(),
            Coupling::ShiftedCopyWithNoise {
                coherence,
                phase_lag,
                band,
            } => f
                .debug_struct("ShiftedCopyWithNoise")
                .field("coherence", coherence)
                .field("phase_lag", phase_lag)
                .field("band", band)
                .finish(),
            Coupling::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Coupling {
    pub(crate) fn validate(&self) -> SimResult<()> {
        match self {
            Coupling::ConstantPhaseShift { phase_lag } => check_finite("phase_lag", *phase_lag),
            Coupling::PpcVonMises {
                phase_lag,
                kappa,
                band,
                ..
            } => {
                check_finite("phase_lag", *phase_lag)?;
                if !kappa.is_finite() || *kappa < 0.0 {
                    return Err(SimulationError::InvalidParameter {
                        name: "kappa",
                        reason: format!("expected a non-negative finite value, got {kappa}"),
                    });
                }
                Band::new(band.fmin, band.fmax).map(|_| ())
            }
            Coupling::ShiftedCopyWithNoise {
                coherence,
                phase_lag,
                band,
            } => {
                check_finite("phase_lag", *phase_lag)?;
                if !(0.0..=1.0).contains(coherence) {
                    return Err(SimulationError::InvalidParameter {
                        name: "coherence",
                        reason: format!("expected a value in [0, 1], got {coherence}"),
                    });
                }
                Band::new(band.fmin, band.fmax).map(|_| ())
            }
            Coupling::Custom(_) => Ok(()),
        }
    }

    /// Produces the coupled waveform. The output always has the parent's
    /// length; custom functions are checked for that.
    pub fn couple(
        &self,
        parent: &Array1<f64>,
        sfreq: f64,
        rng: &mut StdRng,
    ) -> SimResult<Array1<f64>> {
        if parent.is_empty() {
            return Err(SimulationError::EmptyInput { label: "parent" });
        }
        match self {
            Coupling::ConstantPhaseShift { phase_lag } => {
                constant_phase_shift(parent, *phase_lag)
            }
            Coupling::PpcVonMises {
                phase_lag,
                kappa,
                band,
                envelope,
            } => ppc_von_mises(parent, sfreq, *phase_lag, *kappa, *band, *envelope, rng),
            Coupling::ShiftedCopyWithNoise {
                coherence,
                phase_lag,
                band,
            } => shifted_copy_with_noise(parent, sfreq, *coherence, *phase_lag, *band, rng),
            Coupling::Custom(function) => {
                let child = function(parent, sfreq, rng);
                if child.len() != parent.len() {
                    return Err(SimulationError::CouplingLength {
                        expected: parent.len(),
                        got: child.len(),
                    });
                }
                Ok(child)
            }
        }
    }
}

fn check_finite(name: &'static str, value: f64) -> SimResult<()> {
    if !value.is_finite() {
        return Err(SimulationError::InvalidParameter {
            name,
            reason: format!("expected a finite value, got {value}"),
        });
    }
    Ok(())
}

/// Deterministic phase coupling: rotate the parent's instantaneous phase by
/// a constant lag while keeping its amplitude envelope.
fn constant_phase_shift(parent: &Array1<f64>, phase_lag: f64) -> SimResult<Array1<f64>> {
    let analytic = dsp::hilbert_analytic(parent.as_slice().expect("contiguous waveform"))?;
    Ok(analytic
        .iter()
        .map(|value| value.norm() * (value.arg() + phase_lag).cos())
        .collect())
}

/// Probabilistic phase coupling based on per-sample von Mises phase lags.
///
/// The rotated series leaves the original frequency band wherever the drawn
/// lags jump, so it is band-filtered again and only its phase is kept; the
/// chosen envelope is reapplied on top.
fn ppc_von_mises(
    parent: &Array1<f64>,
    sfreq: f64,
    phase_lag: f64,
    kappa: f64,
    band: Band,
    envelope: CouplingEnvelope,
    rng: &mut StdRng,
) -> SimResult<Array1<f64>> {
    let n = parent.len();
    let analytic = dsp::hilbert_analytic(parent.as_slice().expect("contiguous waveform"))?;

    let envelope_amp: Vec<f64> = match envelope {
        CouplingEnvelope::Parent => analytic.iter().map(|value| value.norm()).collect(),
        CouplingEnvelope::Independent => {
            let noise: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
            let filtered = dsp::bandpass_zero_phase(&noise, band, 2, sfreq)?;
            dsp::hilbert_analytic(&filtered)?
                .iter()
                .map(|value| value.norm())
                .collect()
        }
    };

    let rotated: Vec<f64> = analytic
        .iter()
        .zip(envelope_amp.iter())
        .map(|(value, amp)| {
            let lag = sample_von_mises(phase_lag, kappa, rng);
            amp * (value.arg() + lag).cos()
        })
        .collect();

    let refiltered = dsp::bandpass_zero_phase(&rotated, band, 2, sfreq)?;
    let rephased = dsp::hilbert_analytic(&refiltered)?;
    Ok(rephased
        .iter()
        .zip(envelope_amp.iter())
        .map(|(value, amp)| amp * value.arg().cos())
        .collect())
}

/// Coherence-targeted coupling: a weighted mixture of the phase-shifted
/// parent and independent narrowband noise, rescaled to the parent's
/// standard deviation.
fn shifted_copy_with_noise(
    parent: &Array1<f64>,
    sfreq: f64,
    coherence: f64,
    phase_lag: f64,
    band: Band,
    rng: &mut StdRng,
) -> SimResult<Array1<f64>> {
    let n = parent.len();
    let shifted = constant_phase_shift(parent, phase_lag)?;

    let noise: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    let noise = dsp::bandpass_zero_phase(&noise, band, 2, sfreq)?;

    let parent_std = waveform::sample_std(parent.as_slice().expect("contiguous waveform"));
    let shifted_std = waveform::sample_std(shifted.as_slice().expect("contiguous waveform"));
    let noise_std = waveform::sample_std(&noise);
    if shifted_std <= f64::EPSILON || noise_std <= f64::EPSILON {
        return Err(SimulationError::InvalidParameter {
            name: "parent",
            reason: "coherence mixing requires non-degenerate signal and noise".into(),
        });
    }

    // Unit-variance components weighted so the expected coherence with the
    // parent equals the requested value.
    let noise_weight = (1.0 - coherence * coherence).sqrt();
    Ok(shifted
        .iter()
        .zip(noise.iter())
        .map(|(s, w)| {
            parent_std * (coherence * s / shifted_std + noise_weight * w / noise_std)
        })
        .collect())
}

/// Draws one angle from the von Mises distribution with mean direction `mu`
/// and concentration `kappa`, via the Best–Fisher rejection scheme.
/// `kappa = 0` degenerates to the uniform circular distribution.
pub fn sample_von_mises(mu: f64, kappa: f64, rng: &mut StdRng) -> f64 {
    if kappa < 1e-8 {
        return mu + rng.gen_range(-PI..PI);
    }

    let tau = 1.0 + (1.0 + 4.0 * kappa * kappa).sqrt();
    let rho = (tau - (2.0 * tau).sqrt()) / (2.0 * kappa);
    let r = (1.0 + rho * rho) / (2.0 * rho);

    loop {
        let u1: f64 = rng.gen();
        let z = (PI * u1).cos();
        let f = (1.0 + r * z) / (r + z);
        let c = kappa * (r - f);

        let u2: f64 = rng.gen();
        if c * (2.0 - c) - u2 > 0.0 || (c / u2).ln() + 1.0 - c >= 0.0 {
            let u3: f64 = rng.gen();
            let sign = if u3 < 0.5 { -1.0 } else { 1.0 };
            return mu + sign * f.acos();
        }
    }
}

/// Expected phase-locking value of a von Mises phase distribution with the
/// given concentration: `I1(kappa) / I0(kappa)`.
pub fn theoretical_plv(kappa: f64) -> f64 {
    if kappa <= 0.0 {
        return 0.0;
    }
    dsp::bessel_i1(kappa) / dsp::bessel_i0(kappa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::{times_for, Waveform};
    use rand::SeedableRng;

    fn narrowband_parent(seed: u64) -> Array1<f64> {
        let times = times_for(250.0, 10.0);
        Waveform::narrowband_alpha()
            .generate(1, &times, &mut StdRng::seed_from_u64(seed))
            .unwrap()
            .row(0)
            .to_owned()
    }

    /// Circular mean of the per-sample phase difference between two signals.
    fn mean_phase_difference(child: &Array1<f64>, parent: &Array1<f64>) -> f64 {
        let child_analytic = dsp::hilbert_analytic(child.as_slice().unwrap()).unwrap();
        let parent_analytic = dsp::hilbert_analytic(parent.as_slice().unwrap()).unwrap();
        let (mut sum_sin, mut sum_cos) = (0.0, 0.0);
        // Skip the edges where the analytic signal is inaccurate.
        let margin = child.len() / 10;
        for (c, p) in child_analytic[margin..child.len() - margin]
            .iter()
            .zip(parent_analytic[margin..child.len() - margin].iter())
        {
            let diff = c.arg() - p.arg();
            sum_sin += diff.sin();
            sum_cos += diff.cos();
        }
        sum_sin.atan2(sum_cos)
    }

    #[test]
    fn constant_shift_imposes_the_requested_lag() {
        let parent = narrowband_parent(21);
        let lag = PI / 3.0;
        let child = Coupling::ConstantPhaseShift { phase_lag: lag }
            .couple(&parent, 250.0, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(child.len(), parent.len());
        let measured = mean_phase_difference(&child, &parent);
        assert!((measured - lag).abs() < 0.1, "measured lag {measured}");
    }

    #[test]
    fn von_mises_with_high_kappa_approaches_the_constant_shift() {
        let parent = narrowband_parent(22);
        let lag = PI / 4.0;
        let child = Coupling::PpcVonMises {
            phase_lag: lag,
            kappa: 50.0,
            band: Band {
                fmin: 8.0,
                fmax: 12.0,
            },
            envelope: CouplingEnvelope::Parent,
        }
        .couple(&parent, 250.0, &mut StdRng::seed_from_u64(1))
        .unwrap();
        let measured = mean_phase_difference(&child, &parent);
        assert!((measured - lag).abs() < 0.3, "measured lag {measured}");
    }

    #[test]
    fn von_mises_coupling_is_reproducible() {
        let parent = narrowband_parent(23);
        let method = Coupling::PpcVonMises {
            phase_lag: 0.5,
            kappa: 2.0,
            band: Band {
                fmin: 8.0,
                fmax: 12.0,
            },
            envelope: CouplingEnvelope::Independent,
        };
        let first = method
            .couple(&parent, 250.0, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let second = method
            .couple(&parent, 250.0, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn von_mises_sampler_concentrates_around_the_mean() {
        let mut rng = StdRng::seed_from_u64(3);
        let mu = 1.0;
        let n = 20_000;
        let (mut sum_sin, mut sum_cos) = (0.0, 0.0);
        for _ in 0..n {
            let theta = sample_von_mises(mu, 8.0, &mut rng);
            sum_sin += theta.sin();
            sum_cos += theta.cos();
        }
        let mean_direction = sum_sin.atan2(sum_cos);
        let resultant = (sum_sin * sum_sin + sum_cos * sum_cos).sqrt() / n as f64;
        assert!((mean_direction - mu).abs() < 0.05);
        // R should match I1/I0 for the same kappa.
        assert!((resultant - theoretical_plv(8.0)).abs() < 0.02);
    }

    #[test]
    fn zero_kappa_spreads_over_the_whole_circle() {
        let mut rng = StdRng::seed_from_u64(4);
        let n = 20_000;
        let (mut sum_sin, mut sum_cos) = (0.0, 0.0);
        for _ in 0..n {
            let theta = sample_von_mises(0.0, 0.0, &mut rng);
            sum_sin += theta.sin();
            sum_cos += theta.cos();
        }
        let resultant = (sum_sin * sum_sin + sum_cos * sum_cos).sqrt() / n as f64;
        assert!(resultant < 0.05, "resultant {resultant}");
    }

    #[test]
    fn theoretical_plv_grows_with_kappa() {
        assert_eq!(theoretical_plv(0.0), 0.0);
        assert!(theoretical_plv(1.0) < theoretical_plv(5.0));
        assert!(theoretical_plv(5.0) < theoretical_plv(50.0));
        assert!(theoretical_plv(50.0) < 1.0);
    }

    #[test]
    fn custom_coupling_length_is_validated() {
        let parent = narrowband_parent(25);
        let truncate: CouplingFn =
            Arc::new(|parent, _sfreq, _rng| parent.slice(ndarray::s![..10]).to_owned());
        let err = Coupling::Custom(truncate)
            .couple(&parent, 250.0, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, SimulationError::CouplingLength { .. }));
    }

    #[test]
    fn full_coherence_reduces_to_the_shifted_copy() {
        let parent = narrowband_parent(26);
        let lag = PI / 6.0;
        let child = Coupling::ShiftedCopyWithNoise {
            coherence: 1.0,
            phase_lag: lag,
            band: Band {
                fmin: 8.0,
                fmax: 12.0,
            },
        }
        .couple(&parent, 250.0, &mut StdRng::seed_from_u64(2))
        .unwrap();
        let measured = mean_phase_difference(&child, &parent);
        assert!((measured - lag).abs() < 0.1, "measured lag {measured}");
    }
}
