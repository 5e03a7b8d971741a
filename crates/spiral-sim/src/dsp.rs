//! Spectral and filtering kernels backing the waveform and coupling
//! generators.
//!
//! The routines favour clarity over peak performance: everything runs once
//! per simulated source on batch data, so there are no hot loops to protect.
//! The Butterworth design follows the classic analog-prototype ->
//! lowpass-to-bandpass -> bilinear-transform pipeline, and `filtfilt`
//! reproduces zero-phase forward-backward filtering with odd-extension
//! padding and steady-state initial conditions.

use crate::error::{SimResult, SimulationError};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A frequency band in Hz, `0 < fmin < fmax`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub fmin: f64,
    pub fmax: f64,
}

impl Band {
    pub fn new(fmin: f64, fmax: f64) -> SimResult<Self> {
        if !(fmin.is_finite() && fmax.is_finite()) || fmin <= 0.0 || fmax <= fmin {
            return Err(SimulationError::InvalidParameter {
                name: "band",
                reason: format!("expected 0 < fmin < fmax, got [{fmin}, {fmax}]"),
            });
        }
        Ok(Self { fmin, fmax })
    }
}

/// Digital IIR filter in transfer-function form, `a[0] == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct IirFilter {
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

/// Runs an FFT (or inverse FFT) in place. The inverse transform includes the
/// `1/n` normalisation so a forward-inverse pair is the identity.
pub(crate) fn fft_in_place(data: &mut [Complex<f64>], inverse: bool) {
    if data.is_empty() {
        return;
    }
    let mut planner = FftPlanner::new();
    let fft = if inverse {
        planner.plan_fft_inverse(data.len())
    } else {
        planner.plan_fft_forward(data.len())
    };
    fft.process(data);
    if inverse {
        let scale = 1.0 / data.len() as f64;
        for value in data.iter_mut() {
            *value *= scale;
        }
    }
}

/// Analytic signal via the one-sided spectrum multiplier.
///
/// The instantaneous amplitude is the modulus of the result and the
/// instantaneous phase its argument.
pub fn hilbert_analytic(signal: &[f64]) -> SimResult<Vec<Complex<f64>>> {
    let n = signal.len();
    if n == 0 {
        return Err(SimulationError::EmptyInput { label: "signal" });
    }

    let mut spectrum: Vec<Complex<f64>> =
        signal.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft_in_place(&mut spectrum, false);

    // Keep DC (and Nyquist for even lengths) untouched, double the positive
    // frequencies, zero the negative ones.
    let half = n / 2;
    if n % 2 == 0 {
        for value in spectrum.iter_mut().take(half).skip(1) {
            *value *= 2.0;
        }
        for value in spectrum.iter_mut().skip(half + 1) {
            *value = Complex::new(0.0, 0.0);
        }
    } else {
        for value in spectrum.iter_mut().take(half + 1).skip(1) {
            *value *= 2.0;
        }
        for value in spectrum.iter_mut().skip(half + 1) {
            *value = Complex::new(0.0, 0.0);
        }
    }

    fft_in_place(&mut spectrum, true);
    Ok(spectrum)
}

/// Designs a digital Butterworth bandpass filter of the given analog
/// prototype order (the resulting IIR filter has `2 * order` poles).
pub fn butter_bandpass(order: usize, band: Band, sfreq: f64) -> SimResult<IirFilter> {
    if order == 0 {
        return Err(SimulationError::FilterDesign {
            reason: "filter order must be at least 1".into(),
        });
    }
    if !(sfreq.is_finite() && sfreq > 0.0) {
        return Err(SimulationError::FilterDesign {
            reason: format!("sampling frequency must be positive, got {sfreq}"),
        });
    }
    let nyquist = sfreq / 2.0;
    if band.fmax >= nyquist {
        return Err(SimulationError::FilterDesign {
            reason: format!(
                "band edge {} Hz reaches the Nyquist frequency {} Hz",
                band.fmax, nyquist
            ),
        });
    }

    // Prewarped analog band edges (sampling frequency normalised to 2).
    let fs = 2.0;
    let warped_lo = 2.0 * fs * (PI * (band.fmin / nyquist) / fs).tan();
    let warped_hi = 2.0 * fs * (PI * (band.fmax / nyquist) / fs).tan();
    let bw = warped_hi - warped_lo;
    let wo = (warped_lo * warped_hi).sqrt();

    // Analog Butterworth lowpass prototype: poles on the unit circle in the
    // left half-plane, unit gain, no zeros.
    let mut analog_poles = Vec::with_capacity(2 * order);
    for k in 0..order {
        let m = -(order as f64) + 1.0 + 2.0 * k as f64;
        let prototype = -Complex::from_polar(1.0, PI * m / (2.0 * order as f64));
        // Lowpass-to-bandpass: each prototype pole splits into a pair.
        let scaled = prototype * (bw / 2.0);
        let offset = (scaled * scaled - Complex::new(wo * wo, 0.0)).sqrt();
        analog_poles.push(scaled + offset);
        analog_poles.push(scaled - offset);
    }
    // The transform adds `order` zeros at s = 0 and scales the gain.
    let analog_gain = bw.powi(order as i32);

    // Bilinear transform (fs2 = 2 * fs) of poles, zeros, and gain.
    let fs2 = 2.0 * fs;
    let digital_poles: Vec<Complex<f64>> = analog_poles
        .iter()
        .map(|p| (Complex::new(fs2, 0.0) + p) / (Complex::new(fs2, 0.0) - p))
        .collect();
    let mut digital_zeros = vec![Complex::new(1.0, 0.0); order];
    digital_zeros.extend(vec![Complex::new(-1.0, 0.0); order]);

    let denom: Complex<f64> = analog_poles
        .iter()
        .fold(Complex::new(1.0, 0.0), |acc, p| acc * (Complex::new(fs2, 0.0) - p));
    let numer = Complex::new(fs2.powi(order as i32), 0.0);
    let digital_gain = analog_gain * (numer / denom).re;

    let mut b = poly_from_roots(&digital_zeros);
    for coeff in b.iter_mut() {
        *coeff *= digital_gain;
    }
    let a = poly_from_roots(&digital_poles);
    Ok(IirFilter { b, a })
}

/// Expands `prod (x - r_i)` into monic polynomial coefficients. The roots
/// come in conjugate pairs, so the imaginary residue is dropped.
fn poly_from_roots(roots: &[Complex<f64>]) -> Vec<f64> {
    let mut coeffs = vec![Complex::new(1.0, 0.0)];
    for root in roots {
        let mut next = vec![Complex::new(0.0, 0.0); coeffs.len() + 1];
        for (i, &c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c * root;
        }
        coeffs = next;
    }
    coeffs.iter().map(|c| c.re).collect()
}

/// Single-pass IIR filtering (direct form II transposed) with the provided
/// initial conditions. `state` must hold `b.len() - 1` values.
fn lfilter(filter: &IirFilter, signal: &[f64], state: &mut [f64]) -> Vec<f64> {
    let n = filter.b.len();
    let mut out = Vec::with_capacity(signal.len());
    for &x in signal {
        let y = filter.b[0] * x + state[0];
        for j in 0..n - 2 {
            state[j] = filter.b[j + 1] * x + state[j + 1] - filter.a[j + 1] * y;
        }
        state[n - 2] = filter.b[n - 1] * x - filter.a[n - 1] * y;
        out.push(y);
    }
    out
}

/// Steady-state initial conditions for `lfilter`, so a step input produces a
/// step output without a transient.
fn lfilter_zi(filter: &IirFilter) -> SimResult<Vec<f64>> {
    let n = filter.b.len();
    let order = n - 1;

    // Solve (I - companion(a)^T) zi = b[1..] - a[1..] * b[0].
    let mut matrix = vec![vec![0.0; order]; order];
    for (i, row) in matrix.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            let companion_ji = if j == 0 {
                -filter.a[i + 1]
            } else if j == i + 1 {
                1.0
            } else {
                0.0
            };
            *value = if i == j { 1.0 } else { 0.0 } - companion_ji;
        }
    }
    let rhs: Vec<f64> = (0..order)
        .map(|i| filter.b[i + 1] - filter.a[i + 1] * filter.b[0])
        .collect();
    solve_linear(matrix, rhs)
}

/// Gaussian elimination with partial pivoting for the small dense systems
/// used by the filter initialisation.
fn solve_linear(mut matrix: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> SimResult<Vec<f64>> {
    let n = rhs.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                matrix[i][col]
                    .abs()
                    .partial_cmp(&matrix[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if matrix[pivot][col].abs() < 1e-300 {
            return Err(SimulationError::FilterDesign {
                reason: "singular system while computing filter initial conditions".into(),
            });
        }
        matrix.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..n {
            let factor = matrix[row][col] / matrix[col][col];
            for k in col..n {
                matrix[row][k] -= factor * matrix[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut solution = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for col in row + 1..n {
            acc -= matrix[row][col] * solution[col];
        }
        solution[row] = acc / matrix[row][row];
    }
    Ok(solution)
}

/// Zero-phase forward-backward filtering with odd-extension padding.
pub fn filtfilt(filter: &IirFilter, signal: &[f64]) -> SimResult<Vec<f64>> {
    let n = signal.len();
    let ntaps = filter.b.len().max(filter.a.len());
    let padlen = 3 * ntaps;
    if n <= padlen {
        return Err(SimulationError::InvalidParameter {
            name: "signal",
            reason: format!(
                "zero-phase filtering needs more than {padlen} samples, got {n}"
            ),
        });
    }

    let mut extended = Vec::with_capacity(n + 2 * padlen);
    for j in (1..=padlen).rev() {
        extended.push(2.0 * signal[0] - signal[j]);
    }
    extended.extend_from_slice(signal);
    for j in 1..=padlen {
        extended.push(2.0 * signal[n - 1] - signal[n - 1 - j]);
    }

    let zi = lfilter_zi(filter)?;

    let mut state: Vec<f64> = zi.iter().map(|z| z * extended[0]).collect();
    let mut forward = lfilter(filter, &extended, &mut state);

    forward.reverse();
    let mut state: Vec<f64> = zi.iter().map(|z| z * forward[0]).collect();
    let mut backward = lfilter(filter, &forward, &mut state);
    backward.reverse();

    Ok(backward[padlen..padlen + n].to_vec())
}

/// Bandpass-filters a signal with a zero-phase Butterworth filter of the
/// given order. Convenience wrapper used by the generators and the SNR
/// adjustment.
pub fn bandpass_zero_phase(
    signal: &[f64],
    band: Band,
    order: usize,
    sfreq: f64,
) -> SimResult<Vec<f64>> {
    let filter = butter_bandpass(order, band, sfreq)?;
    filtfilt(&filter, signal)
}

/// Modified Bessel function of the first kind, order zero.
///
/// Polynomial approximations from Abramowitz & Stegun (9.8.1 / 9.8.2),
/// accurate to ~1e-7 over the real line.
pub fn bessel_i0(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 3.75 {
        let t = (x / 3.75).powi(2);
        1.0 + t
            * (3.5156229
                + t * (3.0899424
                    + t * (1.2067492 + t * (0.2659732 + t * (0.0360768 + t * 0.0045813)))))
    } else {
        let t = 3.75 / ax;
        (ax.exp() / ax.sqrt())
            * (0.39894228
                + t * (0.01328592
                    + t * (0.00225319
                        + t * (-0.00157565
                            + t * (0.00916281
                                + t * (-0.02057706
                                    + t * (0.02635537
                                        + t * (-0.01647633 + t * 0.00392377))))))))
    }
}

/// Modified Bessel function of the first kind, order one (A&S 9.8.3 / 9.8.4).
pub fn bessel_i1(x: f64) -> f64 {
    let ax = x.abs();
    let value = if ax < 3.75 {
        let t = (x / 3.75).powi(2);
        ax * (0.5
            + t * (0.87890594
                + t * (0.51498869
                    + t * (0.15084934 + t * (0.02658733 + t * (0.00301532 + t * 0.00032411))))))
    } else {
        let t = 3.75 / ax;
        (ax.exp() / ax.sqrt())
            * (0.39894228
                + t * (-0.03988024
                    + t * (-0.00362018
                        + t * (0.00163801
                            + t * (-0.01031555
                                + t * (0.02282967
                                    + t * (-0.02895312
                                        + t * (0.01787654 + t * -0.00420059))))))))
    };
    if x < 0.0 {
        -value
    } else {
        value
    }
}
