//! Waveform generators for independent sources.
//!
//! Every generator follows the same contract: given the number of series, a
//! uniformly spaced time vector, and a dedicated RNG, produce an
//! `n_series x n_times` matrix whose rows are normalised to unit sample
//! standard deviation. The simulation driver rescales rows to each source's
//! target standard deviation afterwards.

use crate::dsp::{self, Band};
use crate::error::{SimResult, SimulationError};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use rustfft::num_complex::Complex;
use std::fmt;
use std::sync::Arc;

/// Structural contract for user-supplied generators: `(n_series, times, rng)
/// -> n_series x n_times`. Output shape is validated by the caller, nothing
/// else is.
pub type WaveformFn = Arc<dyn Fn(usize, &Array1<f64>, &mut StdRng) -> Array2<f64> + Send + Sync>;

/// Waveform specification of a source: either a built-in generator, a fixed
/// array (one row per source), or a custom generator function.
#[derive(Clone)]
pub enum Waveform {
    /// I.i.d. standard normal samples.
    WhiteNoise,
    /// Noise with power spectral density proportional to `1/f^slope`.
    OneOverFNoise { slope: f64 },
    /// Band-limited filtered white noise.
    NarrowbandOscillation { band: Band, order: usize },
    /// Fixed user data, one row per source in the group. Left unscaled by the
    /// driver unless a standard-deviation override is requested.
    Fixed(Array2<f64>),
    /// User-supplied generator function.
    Custom(WaveformFn),
}

impl fmt::Debug for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waveform::WhiteNoise => f.write_str("WhiteNoise"),
            Waveform::OneOverFNoise { slope } => {
                f.debug_struct("OneOverFNoise").field("slope", slope).finish()
            }
            Waveform::NarrowbandOscillation { band, order } => f
                .debug_struct("NarrowbandOscillation")
                .field("band", band)
                .field("order", order)
                .finish(),
            Waveform::Fixed(data) => f
                .debug_struct("Fixed")
                .field("shape", &(data.nrows(), data.ncols()))
                .finish(),
            Waveform::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Waveform {
    /// The default oscillatory waveform: alpha-band filtered noise.
    pub fn narrowband_alpha() -> Self {
        Waveform::NarrowbandOscillation {
            band: Band {
                fmin: 8.0,
                fmax: 12.0,
            },
            order: 2,
        }
    }

    /// The default background activity: pink noise.
    pub fn one_over_f() -> Self {
        Waveform::OneOverFNoise { slope: 1.0 }
    }

    pub(crate) fn validate(&self) -> SimResult<()> {
        match self {
            Waveform::OneOverFNoise { slope } => {
                if !slope.is_finite() || *slope < 0.0 {
                    return Err(SimulationError::InvalidParameter {
                        name: "slope",
                        reason: format!("expected a non-negative finite value, got {slope}"),
                    });
                }
            }
            Waveform::NarrowbandOscillation { band, order } => {
                Band::new(band.fmin, band.fmax)?;
                if *order == 0 {
                    return Err(SimulationError::InvalidParameter {
                        name: "order",
                        reason: "filter order must be at least 1".into(),
                    });
                }
            }
            Waveform::Fixed(data) => {
                if data.is_empty() {
                    return Err(SimulationError::EmptyInput { label: "waveform" });
                }
            }
            Waveform::WhiteNoise | Waveform::Custom(_) => {}
        }
        Ok(())
    }

    /// Generates the requested number of series. Rows of generator output are
    /// normalised to unit standard deviation; `Fixed` data is returned as-is
    /// after a shape check.
    pub fn generate(
        &self,
        n_series: usize,
        times: &Array1<f64>,
        rng: &mut StdRng,
    ) -> SimResult<Array2<f64>> {
        let n_times = times.len();
        if n_times == 0 {
            return Err(SimulationError::EmptyInput { label: "times" });
        }
        match self {
            Waveform::WhiteNoise => {
                let mut data = standard_normal_matrix(n_series, n_times, rng);
                normalize_rows(&mut data)?;
                Ok(data)
            }
            Waveform::OneOverFNoise { slope } => {
                let sfreq = sfreq_from_times(times)?;
                let mut data = standard_normal_matrix(n_series, n_times, rng);
                for mut row in data.rows_mut() {
                    let shaped = one_over_f_shape(row.as_slice().expect("row-major"), *slope, sfreq);
                    row.assign(&Array1::from(shaped));
                }
                normalize_rows(&mut data)?;
                Ok(data)
            }
            Waveform::NarrowbandOscillation { band, order } => {
                let sfreq = sfreq_from_times(times)?;
                let mut data = standard_normal_matrix(n_series, n_times, rng);
                for mut row in data.rows_mut() {
                    let filtered = dsp::bandpass_zero_phase(
                        row.as_slice().expect("row-major"),
                        *band,
                        *order,
                        sfreq,
                    )?;
                    row.assign(&Array1::from(filtered));
                }
                normalize_rows(&mut data)?;
                Ok(data)
            }
            Waveform::Fixed(data) => {
                check_shape(data, n_series, n_times)?;
                Ok(data.clone())
            }
            Waveform::Custom(generator) => {
                let mut data = generator(n_series, times, rng);
                check_shape(&data, n_series, n_times)?;
                normalize_rows(&mut data)?;
                Ok(data)
            }
        }
    }
}

fn check_shape(data: &Array2<f64>, n_series: usize, n_times: usize) -> SimResult<()> {
    if data.nrows() != n_series || data.ncols() != n_times {
        return Err(SimulationError::WaveformShape {
            expected_rows: n_series,
            expected_cols: n_times,
            got_rows: data.nrows(),
            got_cols: data.ncols(),
        });
    }
    Ok(())
}

fn standard_normal_matrix(n_series: usize, n_times: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((n_series, n_times), |_| rng.sample(StandardNormal))
}

/// Shapes a white-noise signal so its power spectral density follows
/// `1/f^slope`. The DC component is removed.
fn one_over_f_shape(signal: &[f64], slope: f64, sfreq: f64) -> Vec<f64> {
    let n = signal.len();
    let mut spectrum: Vec<Complex<f64>> =
        signal.iter().map(|&v| Complex::new(v, 0.0)).collect();
    dsp::fft_in_place(&mut spectrum, false);

    spectrum[0] = Complex::new(0.0, 0.0);
    for (k, value) in spectrum.iter_mut().enumerate().skip(1) {
        let bin = k.min(n - k) as f64;
        let freq = bin * sfreq / n as f64;
        *value *= freq.powf(-slope / 2.0);
    }

    dsp::fft_in_place(&mut spectrum, true);
    spectrum.iter().map(|c| c.re).collect()
}

/// Sampling frequency of a uniformly spaced time vector.
pub fn sfreq_from_times(times: &Array1<f64>) -> SimResult<f64> {
    if times.len() < 2 {
        return Err(SimulationError::InvalidParameter {
            name: "times",
            reason: "at least two time points are required".into(),
        });
    }
    let step = times[1] - times[0];
    if step <= 0.0 {
        return Err(SimulationError::InvalidParameter {
            name: "times",
            reason: "time points must be strictly increasing".into(),
        });
    }
    for window in times.as_slice().expect("contiguous times").windows(2) {
        if ((window[1] - window[0]) - step).abs() > 1e-9 * step.max(1.0) {
            return Err(SimulationError::InvalidParameter {
                name: "times",
                reason: "time points are not uniformly spaced".into(),
            });
        }
    }
    Ok(1.0 / step)
}

/// Uniform time vector for a given sampling rate and duration.
pub fn times_for(sfreq: f64, duration: f64) -> Array1<f64> {
    let n_samples = (sfreq * duration).round() as usize;
    Array1::from_iter((0..n_samples).map(|i| i as f64 / sfreq))
}

/// Population standard deviation of a slice.
pub(crate) fn sample_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Normalises each row to unit standard deviation.
pub(crate) fn normalize_rows(data: &mut Array2<f64>) -> SimResult<()> {
    for mut row in data.rows_mut() {
        let std = sample_std(row.as_slice().expect("row-major"));
        if std <= f64::EPSILON {
            return Err(SimulationError::InvalidParameter {
                name: "waveform",
                reason: "a generated series has zero variance and cannot be normalised".into(),
            });
        }
        row.mapv_inplace(|v| v / std);
    }
    Ok(())
}
