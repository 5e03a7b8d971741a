//! Sensor-space power estimation and SNR adjustment.
//!
//! Local adjustment scales one source at a time so its band-limited sensor
//! power reaches `snr^2` times the pooled noise power. Global adjustment
//! scales all signal sources by one shared factor so the total signal/noise
//! sensor power matches the requested ratio, leaving relative amplitudes
//! among signal sources intact.

use crate::dsp::{self, Band};
use crate::error::{SimResult, SimulationError};
use crate::forward::ForwardOperator;
use crate::source::{SimulatedSource, SourceActivation};
use ndarray::Array1;
use tracing::{debug, warn};

/// Mean sensor-space variance of the activation after forward projection,
/// optionally band-filtered first (zero-phase Butterworth of order 2, as the
/// generators use).
pub fn sensor_space_variance(
    forward: &dyn ForwardOperator,
    activation: &SourceActivation,
    sfreq: f64,
    band: Option<Band>,
    filter: bool,
) -> SimResult<f64> {
    let activation = if filter {
        let band = band.ok_or(SimulationError::SnrBandRequired)?;
        let mut filtered = activation.clone();
        for mut row in filtered.data.rows_mut() {
            let out = dsp::bandpass_zero_phase(
                row.as_slice().expect("row-major activation"),
                band,
                2,
                sfreq,
            )?;
            row.assign(&Array1::from(out));
        }
        filtered
    } else {
        activation.clone()
    };

    let projected = forward.project(&activation)?;
    let n_samples = projected.ncols().max(1);
    let n_sensors = projected.nrows().max(1);
    Ok(projected.iter().map(|v| v * v).sum::<f64>() / (n_samples * n_sensors) as f64)
}

/// Factor the signal must be multiplied by so that
/// `signal_var / noise_var == target_power_ratio`.
pub fn amplitude_adjustment_factor(
    signal_var: f64,
    noise_var: f64,
    target_power_ratio: f64,
) -> SimResult<f64> {
    if noise_var <= 0.0 || !noise_var.is_finite() {
        return Err(SimulationError::ZeroNoiseVariance);
    }
    if signal_var <= 0.0 || !signal_var.is_finite() {
        return Err(SimulationError::ZeroSignalVariance);
    }
    Ok((target_power_ratio * noise_var / signal_var).sqrt())
}

/// Per-source SNR target: amplitude SNR plus the band it is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LocalSnrTarget {
    pub snr: f64,
    pub band: Band,
}

/// Scales each targeted source so its band-limited sensor power equals
/// `snr^2` times the pooled noise power. Waveforms are adjusted in place.
pub(crate) fn adjust_snr_local(
    forward: &dyn ForwardOperator,
    sfreq: f64,
    n_times: usize,
    signal_sources: &mut [SimulatedSource],
    targets: &[(usize, LocalSnrTarget)],
    noise_sources: &[SimulatedSource],
) -> SimResult<()> {
    if targets.is_empty() {
        return Ok(());
    }
    if noise_sources.is_empty() {
        return Err(SimulationError::NoNoiseSources);
    }
    let noise_activation = SourceActivation::combine(noise_sources.iter(), n_times)?;

    for &(index, target) in targets {
        let noise_var = sensor_space_variance(
            forward,
            &noise_activation,
            sfreq,
            Some(target.band),
            true,
        )?;

        let source = &mut signal_sources[index];
        let activation = SourceActivation::combine(std::iter::once(&*source), n_times)?;
        let signal_var =
            sensor_space_variance(forward, &activation, sfreq, Some(target.band), true)?;

        let factor =
            amplitude_adjustment_factor(signal_var, noise_var, target.snr * target.snr)?;
        debug!(
            source = source.name.as_str(),
            factor, "applying local SNR adjustment"
        );
        source.waveform.mapv_inplace(|v| v * factor);
    }
    Ok(())
}

/// Scales all signal sources by one factor so the total signal sensor power
/// relative to the total noise sensor power matches `target_ratio`.
pub(crate) fn adjust_snr_global(
    forward: &dyn ForwardOperator,
    sfreq: f64,
    n_times: usize,
    signal_sources: &mut [SimulatedSource],
    target_ratio: f64,
    band: Band,
    noise_sources: &[SimulatedSource],
) -> SimResult<()> {
    if signal_sources.is_empty() {
        warn!("no signal sources were added, skipping the requested global SNR adjustment");
        return Ok(());
    }
    if noise_sources.is_empty() {
        return Err(SimulationError::NoNoiseSources);
    }

    let noise_activation = SourceActivation::combine(noise_sources.iter(), n_times)?;
    let noise_var =
        sensor_space_variance(forward, &noise_activation, sfreq, Some(band), true)?;

    let signal_activation = SourceActivation::combine(signal_sources.iter(), n_times)?;
    let signal_var =
        sensor_space_variance(forward, &signal_activation, sfreq, Some(band), true)?;

    let factor = amplitude_adjustment_factor(signal_var, noise_var, target_ratio)?;
    debug!(factor, "applying global SNR adjustment");
    for source in signal_sources.iter_mut() {
        source.waveform.mapv_inplace(|v| v * factor);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardModel;
    use crate::source::SourceRole;
    use ndarray::Array2;
    use std::f64::consts::PI;

    fn tone_source(name: &str, vertno: u64, freq: f64, amplitude: f64, role: SourceRole) -> SimulatedSource {
        let sfreq = 250.0;
        let waveform =
            Array1::from_iter((0..2500).map(|i| amplitude * (2.0 * PI * freq * i as f64 / sfreq).sin()));
        SimulatedSource {
            name: name.into(),
            role,
            locations: vec![(0, vertno)],
            vertex_scales: vec![1.0],
            waveform,
        }
    }

    fn identity_forward(n: usize) -> ForwardModel {
        ForwardModel::new(
            Array2::eye(n),
            (0..n as u64).map(|v| (0, v)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn variance_of_a_unit_tone_is_half() {
        let source = tone_source("s", 0, 10.0, 1.0, SourceRole::Signal);
        let activation = SourceActivation::combine([&source], 2500).unwrap();
        let forward = identity_forward(1);
        let var = sensor_space_variance(&forward, &activation, 250.0, None, false).unwrap();
        assert!((var - 0.5).abs() < 1e-3, "variance {var}");
    }

    #[test]
    fn adjustment_factor_hits_the_requested_ratio() {
        let factor = amplitude_adjustment_factor(2.0, 8.0, 4.0).unwrap();
        // (factor^2 * 2.0) / 8.0 == 4.0
        assert!((factor * factor * 2.0 / 8.0 - 4.0).abs() < 1e-12);
    }

    #[test]
    fn zero_variances_are_explicit_errors() {
        assert_eq!(
            amplitude_adjustment_factor(1.0, 0.0, 1.0).unwrap_err(),
            SimulationError::ZeroNoiseVariance
        );
        assert_eq!(
            amplitude_adjustment_factor(0.0, 1.0, 1.0).unwrap_err(),
            SimulationError::ZeroSignalVariance
        );
    }

    #[test]
    fn local_adjustment_reaches_snr_squared() {
        let sfreq = 250.0;
        let band = Band {
            fmin: 8.0,
            fmax: 12.0,
        };
        let mut signal = vec![tone_source("s1", 0, 10.0, 1.0, SourceRole::Signal)];
        let noise = vec![
            tone_source("n1", 1, 10.0, 2.0, SourceRole::Noise),
            tone_source("n2", 2, 10.0, 1.0, SourceRole::Noise),
        ];
        let forward = identity_forward(3);
        let target = LocalSnrTarget { snr: 3.0, band };
        adjust_snr_local(&forward, sfreq, 2500, &mut signal, &[(0, target)], &noise).unwrap();

        let signal_var = sensor_space_variance(
            &forward,
            &SourceActivation::combine(signal.iter(), 2500).unwrap(),
            sfreq,
            Some(band),
            true,
        )
        .unwrap();
        let noise_var = sensor_space_variance(
            &forward,
            &SourceActivation::combine(noise.iter(), 2500).unwrap(),
            sfreq,
            Some(band),
            true,
        )
        .unwrap();
        assert!(
            (signal_var / noise_var - 9.0).abs() < 1e-6,
            "power ratio {}",
            signal_var / noise_var
        );
    }

    #[test]
    fn global_adjustment_preserves_relative_amplitudes() {
        let sfreq = 250.0;
        let band = Band {
            fmin: 8.0,
            fmax: 12.0,
        };
        let mut signal = vec![
            tone_source("s1", 0, 10.0, 1.0, SourceRole::Signal),
            tone_source("s2", 1, 10.0, 3.0, SourceRole::Signal),
        ];
        let noise = vec![tone_source("n1", 2, 10.0, 2.0, SourceRole::Noise)];
        let forward = identity_forward(3);

        let before_ratio = crate::waveform::sample_std(signal[1].waveform.as_slice().unwrap())
            / crate::waveform::sample_std(signal[0].waveform.as_slice().unwrap());

        adjust_snr_global(&forward, sfreq, 2500, &mut signal, 5.0, band, &noise).unwrap();

        let after_ratio = crate::waveform::sample_std(signal[1].waveform.as_slice().unwrap())
            / crate::waveform::sample_std(signal[0].waveform.as_slice().unwrap());
        assert!((before_ratio - after_ratio).abs() < 1e-9);

        let signal_var = sensor_space_variance(
            &forward,
            &SourceActivation::combine(signal.iter(), 2500).unwrap(),
            sfreq,
            Some(band),
            true,
        )
        .unwrap();
        let noise_var = sensor_space_variance(
            &forward,
            &SourceActivation::combine(noise.iter(), 2500).unwrap(),
            sfreq,
            Some(band),
            true,
        )
        .unwrap();
        assert!(
            (signal_var / noise_var - 5.0).abs() < 1e-6,
            "power ratio {}",
            signal_var / noise_var
        );
    }
}
