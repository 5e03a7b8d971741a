//! Minimal configuration: a coupled pair of oscillatory sources over a 1/f
//! noise background, printed as a JSON summary.

use spiral_sim::{
    Band, Coupling, LocationSpec, NoiseSources, PointSources, SourceSimulator, SourceSpace,
    Waveform,
};
use std::f64::consts::PI;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let src = SourceSpace::single(128)?;
    let mut sim = SourceSimulator::new(src);

    sim.add_noise_sources(NoiseSources::new(LocationSpec::RandomVertices { n: 5 }))?;
    sim.add_point_sources(
        PointSources::new(
            LocationSpec::RandomVertices { n: 2 },
            Waveform::NarrowbandOscillation {
                band: Band {
                    fmin: 8.0,
                    fmax: 12.0,
                },
                order: 2,
            },
        )
        .with_names(["s1", "s2"]),
    )?;
    sim.set_coupling([(
        "s1",
        "s2",
        Coupling::PpcVonMises {
            phase_lag: PI / 2.0,
            kappa: 5.0,
            band: Band {
                fmin: 8.0,
                fmax: 12.0,
            },
            envelope: spiral_sim::CouplingEnvelope::Parent,
        },
    )])?;

    let config = sim.simulate(250.0, 30.0, None, None, None, Some(123))?;
    println!("{}", serde_json::to_string_pretty(&config.summary())?);
    Ok(())
}
