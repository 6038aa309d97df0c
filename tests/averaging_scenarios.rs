use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{Array1, array};
use specavg::{
    Averager, AveragingConfig, AveragingError, ChannelSelection, ChannelTag, CubatureOptions,
    Domain, ErrorNorm, GridWeighting, ModelFailure, Normalization, OutputKind, ParameterSpec,
    SpectrumSample, WeightFunction, WeightRegistry, integrate,
};
use std::sync::atomic::{AtomicUsize, Ordering};

const CS: ChannelTag = ChannelTag::cross_section(OutputKind::Absorption);
const DC: ChannelTag = ChannelTag::dichroism(OutputKind::Absorption);

fn lorentzian(p: &[f64]) -> Result<SpectrumSample, ModelFailure> {
    let grid = Array1::linspace(450.0, 650.0, 11);
    let peak = 500.0 + 2.0 * p[0];
    let band = grid.mapv(|l| 100.0 / ((l - peak).powi(2) + 100.0));
    let dichroism = Array1::from_iter(
        grid.iter()
            .zip(band.iter())
            .map(|(&l, &v)| 0.01 * v * (l - peak) / 10.0),
    );
    Ok(SpectrumSample::new(grid)
        .with_channel(CS, band)
        .with_channel(DC, dichroism))
}

fn paired() -> ChannelSelection {
    ChannelSelection::paired(&[OutputKind::Absorption]).unwrap()
}

fn with_tol(relative_tol: f64) -> AveragingConfig {
    AveragingConfig {
        cubature: CubatureOptions::default().with_relative_tol(relative_tol),
        normalization: Normalization::Expectation,
    }
}

#[test]
fn uniform_average_agrees_with_refined_naive_grid() {
    let mut registry = WeightRegistry::default();
    registry
        .register("size", WeightFunction::uniform(10.0, 50.0).unwrap())
        .unwrap();
    let averager = Averager::new(
        vec![ParameterSpec::new("size", Domain::finite(10.0, 50.0))],
        &registry,
        &lorentzian,
        paired(),
        with_tol(1e-8),
    )
    .unwrap();
    let avg = averager.average().unwrap();
    assert!(avg.converged);

    let mut previous = f64::INFINITY;
    for n in [10, 40, 160] {
        let naive = averager
            .naive_grid_average(n, GridWeighting::Unweighted)
            .unwrap();
        let diff = avg.max_abs_difference(&naive).unwrap();
        assert!(diff < previous, "grid {n}: {diff} !< {previous}");
        previous = diff;
    }
    assert!(previous < 1e-3);
}

#[test]
fn density_weighted_grid_matches_quadrature_for_a_narrow_normal() {
    let mut registry = WeightRegistry::default();
    registry
        .register("size", WeightFunction::normal(30.0, 3.0).unwrap())
        .unwrap();
    let averager = Averager::new(
        vec![ParameterSpec::new("size", Domain::lower_bounded(0.0)).with_grid_bounds(0.0, 60.0)],
        &registry,
        &lorentzian,
        paired(),
        with_tol(1e-7),
    )
    .unwrap();
    let avg = averager.average().unwrap();
    assert!(avg.converged);
    let naive = averager
        .naive_grid_average(400, GridWeighting::Density)
        .unwrap();
    assert!(avg.max_abs_difference(&naive).unwrap() < 1e-4);
}

#[test]
fn tighter_tolerance_never_costs_fewer_evaluations() {
    let mut registry = WeightRegistry::default();
    registry
        .register("size", WeightFunction::log_normal(30f64.ln(), 0.3).unwrap())
        .unwrap();
    registry
        .register("tilt", WeightFunction::uniform(-1.0, 1.0).unwrap())
        .unwrap();
    let model = |p: &[f64]| -> Result<SpectrumSample, ModelFailure> {
        let base = lorentzian(&p[..1])?;
        let tilt = 1.0 + 0.3 * p[1] * p[1];
        Ok(SpectrumSample {
            wavelengths: base.wavelengths,
            channels: base
                .channels
                .into_iter()
                .map(|mut c| {
                    c.values *= tilt;
                    c
                })
                .collect(),
        })
    };
    let mut previous = 0;
    for rel in [1e-2, 1e-3, 1e-4, 1e-5] {
        let avg = Averager::new(
            vec![
                ParameterSpec::new("size", Domain::lower_bounded(0.0)),
                ParameterSpec::new("tilt", Domain::finite(-1.0, 1.0)),
            ],
            &registry,
            &model,
            paired(),
            with_tol(rel),
        )
        .unwrap()
        .average()
        .unwrap();
        assert!(avg.evaluations >= previous, "{rel}: {} < {previous}", avg.evaluations);
        previous = avg.evaluations;
    }
}

#[test]
fn paired_linear_pair_integrates_to_one_half() {
    let f = |x: &[f64]| -> Result<Array1<f64>, AveragingError> { Ok(array![x[0], 1.0 - x[0]]) };
    let opts = CubatureOptions::default()
        .with_error_norm(ErrorNorm::Paired)
        .with_max_evals(1000);
    let r = integrate(&f, &[0.0], &[1.0], 2, &opts).unwrap();
    assert!(r.converged);
    assert!(r.evaluations < 1000);
    assert_relative_eq!(r.integral[0], 0.5, max_relative = 1e-12);
    assert_relative_eq!(r.integral[1], 0.5, max_relative = 1e-12);
}

#[test]
fn standard_normal_weight_preserves_a_constant_pair() {
    let model = |_: &[f64]| -> Result<SpectrumSample, ModelFailure> {
        Ok(SpectrumSample::new(array![500.0])
            .with_channel(CS, array![1.0])
            .with_channel(DC, array![1.0]))
    };
    let mut registry = WeightRegistry::default();
    registry
        .register("offset", WeightFunction::normal(0.0, 1.0).unwrap())
        .unwrap();
    let avg = Averager::new(
        vec![ParameterSpec::new("offset", Domain::Real)],
        &registry,
        &model,
        paired(),
        AveragingConfig::default(),
    )
    .unwrap()
    .average()
    .unwrap();
    assert!(avg.converged);
    assert_eq!(avg.error_norm, ErrorNorm::Paired);
    assert_relative_eq!(avg.values[[0, 0]], 1.0, max_relative = 1e-4);
    assert_relative_eq!(avg.values[[0, 1]], 1.0, max_relative = 1e-4);
}

#[test]
fn overweight_density_is_rejected() {
    let mut registry = WeightRegistry::default();
    let heavy = WeightFunction::custom("heavy", Domain::finite(2.0, 4.0), |_| 0.75).unwrap();
    match registry.register("size", heavy) {
        Err(AveragingError::InvalidWeight { parameter, .. }) => assert_eq!(parameter, "size"),
        other => panic!("expected InvalidWeight, got {other:?}"),
    }
}

#[test]
fn shape_change_on_second_call_aborts_the_run() {
    let calls = AtomicUsize::new(0);
    let model = |_: &[f64]| -> Result<SpectrumSample, ModelFailure> {
        let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
        let sample = SpectrumSample::new(array![500.0, 600.0]).with_channel(CS, array![1.0, 2.0]);
        Ok(if first {
            sample.with_channel(DC, array![0.1, 0.2])
        } else {
            sample
        })
    };
    let registry = WeightRegistry::default();
    let result = Averager::new(
        vec![ParameterSpec::new("size", Domain::finite(1.0, 2.0))],
        &registry,
        &model,
        paired(),
        AveragingConfig::default(),
    )
    .unwrap()
    .average();
    assert!(matches!(
        result,
        Err(AveragingError::ModelEvaluation { call: 2, .. })
    ));
}

#[test]
fn parallel_workers_reproduce_the_sequential_average() {
    let mut registry = WeightRegistry::default();
    registry
        .register("size", WeightFunction::normal(25.0, 5.0).unwrap())
        .unwrap();
    let run = |workers: usize| {
        let config = AveragingConfig {
            cubature: CubatureOptions::default()
                .with_relative_tol(1e-6)
                .with_workers(workers),
            normalization: Normalization::TruncatedExpectation,
        };
        Averager::new(
            vec![ParameterSpec::new("size", Domain::finite(5.0, 45.0))],
            &registry,
            &lorentzian,
            paired(),
            config,
        )
        .unwrap()
        .average()
        .unwrap()
    };
    let serial = run(1);
    let parallel = run(4);
    assert!(serial.converged && parallel.converged);
    for (a, b) in serial.values.iter().zip(parallel.values.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn config_round_trips_through_json() {
    let json = r#"{
        "cubature": { "relative_tol": 1e-5, "max_evals": 5000, "workers": 2 },
        "normalization": "TruncatedExpectation"
    }"#;
    let config: AveragingConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.cubature.max_evals, 5000);
    assert_eq!(config.normalization, Normalization::TruncatedExpectation);
    let back: AveragingConfig =
        serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
    assert_eq!(back, config);
}
