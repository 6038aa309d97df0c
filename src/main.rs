use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use log::info;
use ndarray::{Array1, array};
use serde::Serialize;
use specavg::{
    AveragedSpectrum, Averager, AveragingConfig, AveragingError, CachedModel, ChannelSelection,
    ChannelTag, CubatureOptions, Domain, ErrorNorm, GridWeighting, ModelFailure, NaiveAverage,
    Normalization, OutputKind, ParameterMeaning, ParameterSpec, SpectrumSample, WeightFunction,
    WeightRegistry, integrate,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Parser, Debug)]
#[command(name = "specavg")]
#[command(version = env!("SPECAVG_VERSION_LINE"))]
#[command(about = "Weighted quadrature averaging of simulated spectra", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Integrate a built-in density over its support and report the drift.
    CheckWeight(CheckWeightArgs),
    /// Average the toy plasmon spectrum over a particle size distribution.
    Average(AverageArgs),
    /// Run the reference scenarios and print a summary.
    Scenarios,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DistributionArg {
    Normal,
    LogNormal,
    Exponential,
    Uniform,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum NormalizationArg {
    Expectation,
    UniformMean,
    TruncatedExpectation,
}

impl From<NormalizationArg> for Normalization {
    fn from(arg: NormalizationArg) -> Self {
        match arg {
            NormalizationArg::Expectation => Normalization::Expectation,
            NormalizationArg::UniformMean => Normalization::UniformMean,
            NormalizationArg::TruncatedExpectation => Normalization::TruncatedExpectation,
        }
    }
}

#[derive(Args, Debug)]
struct DistributionArgs {
    #[arg(long = "distribution", value_enum, default_value_t = DistributionArg::Normal)]
    distribution: DistributionArg,
    /// Mean (normal, uniform), median (log-normal) or mean decay length (exponential).
    #[arg(long = "mean", default_value_t = 40.0)]
    mean: f64,
    /// Standard deviation (normal, uniform) or relative spread (log-normal).
    #[arg(long = "sd", default_value_t = 4.0)]
    sd: f64,
}

#[derive(Args, Debug)]
struct CheckWeightArgs {
    #[command(flatten)]
    dist: DistributionArgs,
    #[arg(long = "tol", default_value_t = 0.01)]
    tol: f64,
}

#[derive(Args, Debug)]
struct AverageArgs {
    #[command(flatten)]
    dist: DistributionArgs,
    /// Smallest particle size integrated over (nm).
    #[arg(long = "min", default_value_t = 5.0)]
    min: f64,
    /// Largest particle size integrated over (nm).
    #[arg(long = "max", default_value_t = 80.0)]
    max: f64,
    /// JSON file with an `AveragingConfig`; flags below override it.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    #[arg(long = "rel-tol")]
    rel_tol: Option<f64>,
    #[arg(long = "max-evals")]
    max_evals: Option<usize>,
    #[arg(long = "workers")]
    workers: Option<usize>,
    #[arg(long = "normalization", value_enum)]
    normalization: Option<NormalizationArg>,
    /// Nodes of the density-weighted comparison grid.
    #[arg(long = "grid", default_value_t = 64)]
    grid: usize,
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::CheckWeight(args) => run_check_weight(args),
        Command::Average(args) => run_average(args),
        Command::Scenarios => run_scenarios(),
    }
}

fn build_weight(args: &DistributionArgs) -> Result<WeightFunction, String> {
    let DistributionArgs { distribution, mean, sd } = *args;
    let weight = match distribution {
        DistributionArg::Normal => WeightFunction::normal(mean, sd),
        DistributionArg::LogNormal => WeightFunction::log_normal(mean.ln(), sd / mean),
        DistributionArg::Exponential => WeightFunction::exponential(1.0 / mean),
        DistributionArg::Uniform => {
            let half = sd * 3f64.sqrt();
            WeightFunction::uniform(mean - half, mean + half)
        }
    };
    weight.map_err(|e| e.to_string())
}

fn run_check_weight(args: CheckWeightArgs) -> Result<(), String> {
    let weight = build_weight(&args.dist)?;
    let mut registry = WeightRegistry::new(args.tol).map_err(|e| e.to_string())?;
    let report = registry
        .register("size", weight)
        .map_err(|e| e.to_string())?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Weight", "Mass", "Quad. error", "Drift", "Evaluations"]);
    table.add_row(Row::from(vec![
        Cell::new(&report.weight),
        Cell::new(format!("{:.10}", report.support_mass)),
        Cell::new(format!("{:.2e}", report.quadrature_error)),
        Cell::new(format!("{:+.2e}", report.drift)),
        Cell::new(report.evaluations),
    ]));
    println!("{table}");
    Ok(())
}

const TOY_EXT: ChannelTag = ChannelTag::cross_section(OutputKind::Extinction);
const TOY_EXT_DICHROISM: ChannelTag = ChannelTag::dichroism(OutputKind::Extinction);

/// Single Lorentzian plasmon band whose position, width and strength grow
/// with particle size. Dichroism follows the bisignate shape of the band.
fn plasmon_model(p: &[f64]) -> Result<SpectrumSample, ModelFailure> {
    let size = p[0];
    if !(size.is_finite() && size > 0.0) {
        return Err(format!("particle size must be positive, got {size}").into());
    }
    let grid = Array1::linspace(400.0, 800.0, 41);
    let peak = 480.0 + 2.5 * size;
    let width = 25.0 + 0.4 * size;
    let strength = size.powi(3) * 1e-3;
    let extinction = grid.mapv(|l| strength * width * width / ((l - peak).powi(2) + width * width));
    let scattering = &extinction * (size * size / (size * size + 900.0));
    let absorption = &extinction - &scattering;
    let dichroism = |band: &Array1<f64>| {
        Array1::from_iter(
            grid.iter()
                .zip(band.iter())
                .map(|(&l, &v)| 0.02 * v * (l - peak) / width),
        )
    };
    let ext_dc = dichroism(&extinction);
    let abs_dc = dichroism(&absorption);
    let sca_dc = dichroism(&scattering);
    Ok(SpectrumSample::new(grid)
        .with_channel(TOY_EXT, extinction)
        .with_channel(TOY_EXT_DICHROISM, ext_dc)
        .with_channel(ChannelTag::cross_section(OutputKind::Absorption), absorption)
        .with_channel(ChannelTag::dichroism(OutputKind::Absorption), abs_dc)
        .with_channel(ChannelTag::cross_section(OutputKind::Scattering), scattering)
        .with_channel(ChannelTag::dichroism(OutputKind::Scattering), sca_dc))
}

fn load_config(path: Option<&Path>) -> Result<AveragingConfig, String> {
    let Some(path) = path else {
        return Ok(AveragingConfig::default());
    };
    let text = fs::read_to_string(path)
        .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))
}

#[derive(Serialize)]
struct AverageReport<'a> {
    averaged: &'a AveragedSpectrum,
    naive: &'a NaiveAverage,
    max_abs_difference: f64,
}

fn run_average(args: AverageArgs) -> Result<(), String> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(rel) = args.rel_tol {
        config.cubature.relative_tol = rel;
    }
    if let Some(max_evals) = args.max_evals {
        config.cubature.max_evals = max_evals;
    }
    if let Some(workers) = args.workers {
        config.cubature.workers = workers;
    }
    if let Some(normalization) = args.normalization {
        config.normalization = normalization.into();
    }

    let mut registry = WeightRegistry::default();
    registry
        .register("size", build_weight(&args.dist)?)
        .map_err(|e| e.to_string())?;
    let selection = ChannelSelection::paired(&[OutputKind::Extinction]).map_err(|e| e.to_string())?;
    let params = vec![
        ParameterSpec::new("size", Domain::finite(args.min, args.max))
            .with_meaning(ParameterMeaning::Size),
    ];
    let averager = Averager::new(params, &registry, &plasmon_model, selection, config)
        .map_err(|e| e.to_string())?;

    info!("averaging toy plasmon spectrum over size in [{}, {}]", args.min, args.max);
    let averaged = averager.average().map_err(|e| e.to_string())?;
    let weighting = if averaged.normalization == Normalization::UniformMean {
        GridWeighting::Unweighted
    } else {
        GridWeighting::Density
    };
    let naive = averager
        .naive_grid_average(args.grid, weighting)
        .map_err(|e| e.to_string())?;
    let max_abs_difference = averaged
        .max_abs_difference(&naive)
        .map_err(|e| e.to_string())?;

    if args.json {
        let report = AverageReport {
            averaged: &averaged,
            naive: &naive,
            max_abs_difference,
        };
        let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{text}");
        return Ok(());
    }

    let ext = averaged.channel(TOY_EXT).ok_or("extinction channel missing")?;
    let ext_err = averaged
        .channel_error(TOY_EXT)
        .ok_or("extinction channel missing")?;
    let dc = averaged
        .channel(TOY_EXT_DICHROISM)
        .ok_or("dichroism channel missing")?;
    let naive_ext = naive.channel(TOY_EXT).ok_or("extinction channel missing")?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "λ (nm)",
            "Extinction",
            "± error",
            "Dichroism",
            "Naive grid",
            "|Δ|",
        ]);
    for (i, &l) in averaged.wavelengths.iter().enumerate() {
        table.add_row(Row::from(vec![
            Cell::new(format!("{l:.1}")),
            Cell::new(format!("{:.6}", ext[i])),
            Cell::new(format!("{:.1e}", ext_err[i])),
            Cell::new(format!("{:+.6}", dc[i])),
            Cell::new(format!("{:.6}", naive_ext[i])),
            Cell::new(format!("{:.1e}", (ext[i] - naive_ext[i]).abs())),
        ]));
    }
    println!("{table}");
    println!(
        "cubature: {} evaluations, {} regions, converged = {}, norm = {:?}; naive grid: {} evaluations; max |Δ| = {:.3e}",
        averaged.evaluations,
        averaged.regions,
        averaged.converged,
        averaged.error_norm,
        naive.evaluations,
        max_abs_difference
    );
    for w in &averaged.warnings {
        println!("warning: {w}");
    }
    Ok(())
}

struct ScenarioOutcome {
    name: &'static str,
    detail: String,
    evaluations: usize,
    passed: bool,
}

fn scenario_paired_linear() -> Result<ScenarioOutcome, String> {
    let f = |x: &[f64]| -> Result<Array1<f64>, AveragingError> { Ok(array![x[0], 1.0 - x[0]]) };
    let opts = CubatureOptions::default()
        .with_error_norm(ErrorNorm::Paired)
        .with_max_evals(1000);
    let r = integrate(&f, &[0.0], &[1.0], 2, &opts).map_err(|e| e.to_string())?;
    let passed = r.converged
        && r.evaluations < 1000
        && r.integral.iter().all(|v| (v - 0.5).abs() < 1e-8);
    Ok(ScenarioOutcome {
        name: "paired [t, 1-t] over [0, 1]",
        detail: format!("[{:.10}, {:.10}]", r.integral[0], r.integral[1]),
        evaluations: r.evaluations,
        passed,
    })
}

fn scenario_gaussian_constant() -> Result<ScenarioOutcome, String> {
    let model = |_: &[f64]| -> Result<SpectrumSample, ModelFailure> {
        Ok(SpectrumSample::new(array![550.0])
            .with_channel(TOY_EXT, array![1.0])
            .with_channel(TOY_EXT_DICHROISM, array![1.0]))
    };
    let mut registry = WeightRegistry::default();
    registry
        .register("x", WeightFunction::normal(0.0, 1.0).map_err(|e| e.to_string())?)
        .map_err(|e| e.to_string())?;
    let selection = ChannelSelection::paired(&[OutputKind::Extinction]).map_err(|e| e.to_string())?;
    let avg = Averager::new(
        vec![ParameterSpec::new("x", Domain::Real)],
        &registry,
        &model,
        selection,
        AveragingConfig::default(),
    )
    .and_then(|a| a.average())
    .map_err(|e| e.to_string())?;
    let passed = avg.converged && avg.values.iter().all(|v| (v - 1.0).abs() < 1e-4);
    Ok(ScenarioOutcome {
        name: "N(0,1)-weighted [1, 1] over the real line",
        detail: format!("[{:.8}, {:.8}]", avg.values[[0, 0]], avg.values[[0, 1]]),
        evaluations: avg.evaluations,
        passed,
    })
}

fn scenario_uniform_vs_grid() -> Result<ScenarioOutcome, String> {
    let mut registry = WeightRegistry::default();
    registry
        .register("size", WeightFunction::uniform(20.0, 60.0).map_err(|e| e.to_string())?)
        .map_err(|e| e.to_string())?;
    let selection = ChannelSelection::paired(&[OutputKind::Extinction]).map_err(|e| e.to_string())?;
    let config = AveragingConfig {
        cubature: CubatureOptions::default().with_relative_tol(1e-8),
        ..AveragingConfig::default()
    };
    let averager = Averager::new(
        vec![ParameterSpec::new("size", Domain::finite(20.0, 60.0))],
        &registry,
        &plasmon_model,
        selection,
        config,
    )
    .map_err(|e| e.to_string())?;
    let avg = averager.average().map_err(|e| e.to_string())?;
    let mut diffs = Vec::new();
    for n in [8, 32, 128] {
        let naive = averager
            .naive_grid_average(n, GridWeighting::Unweighted)
            .map_err(|e| e.to_string())?;
        diffs.push(avg.max_abs_difference(&naive).map_err(|e| e.to_string())?);
    }
    Ok(ScenarioOutcome {
        name: "uniform weight vs naive grid (8, 32, 128)",
        detail: diffs
            .iter()
            .map(|d| format!("{d:.2e}"))
            .collect::<Vec<_>>()
            .join(" > "),
        evaluations: avg.evaluations,
        passed: diffs.windows(2).all(|w| w[0] > w[1]),
    })
}

fn scenario_tolerance_sweep() -> Result<ScenarioOutcome, String> {
    let cached = CachedModel::new(plasmon_model, 9);
    let mut registry = WeightRegistry::default();
    registry
        .register("size", WeightFunction::normal(40.0, 4.0).map_err(|e| e.to_string())?)
        .map_err(|e| e.to_string())?;
    let mut evaluations = Vec::new();
    for rel in [1e-2, 1e-3, 1e-4, 1e-5, 1e-6] {
        let selection =
            ChannelSelection::paired(&[OutputKind::Extinction]).map_err(|e| e.to_string())?;
        let config = AveragingConfig {
            cubature: CubatureOptions::default().with_relative_tol(rel),
            ..AveragingConfig::default()
        };
        let avg = Averager::new(
            vec![ParameterSpec::new("size", Domain::finite(5.0, 80.0))],
            &registry,
            &cached,
            selection,
            config,
        )
        .and_then(|a| a.average())
        .map_err(|e| e.to_string())?;
        evaluations.push(avg.evaluations);
    }
    Ok(ScenarioOutcome {
        name: "tolerance sweep 1e-2 .. 1e-6",
        detail: format!(
            "{} (cache: {} samples, {} hits)",
            evaluations
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(" <= "),
            cached.len(),
            cached.hits()
        ),
        evaluations: evaluations.iter().sum(),
        passed: evaluations.windows(2).all(|w| w[0] <= w[1]),
    })
}

fn scenario_heavy_density() -> Result<ScenarioOutcome, String> {
    let heavy = WeightFunction::custom("heavy", Domain::finite(0.0, 1.0), |_| 1.5)
        .map_err(|e| e.to_string())?;
    let mut registry = WeightRegistry::default();
    let outcome = registry.register("x", heavy);
    Ok(ScenarioOutcome {
        name: "density with mass 1.5 is rejected",
        detail: match &outcome {
            Ok(report) => format!("accepted with drift {:+.3}", report.drift),
            Err(e) => e.to_string(),
        },
        evaluations: 0,
        passed: matches!(outcome, Err(AveragingError::InvalidWeight { .. })),
    })
}

fn scenario_shape_change() -> Result<ScenarioOutcome, String> {
    let calls = AtomicUsize::new(0);
    let model = |_: &[f64]| -> Result<SpectrumSample, ModelFailure> {
        let grid = if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            array![500.0, 600.0]
        } else {
            array![500.0, 600.0, 700.0]
        };
        let n = grid.len();
        Ok(SpectrumSample::new(grid).with_channel(TOY_EXT, Array1::ones(n)))
    };
    let registry = WeightRegistry::default();
    let selection = ChannelSelection::single(vec![TOY_EXT]).map_err(|e| e.to_string())?;
    let outcome = Averager::new(
        vec![ParameterSpec::new("x", Domain::finite(0.0, 1.0))],
        &registry,
        &model,
        selection,
        AveragingConfig::default(),
    )
    .and_then(|a| a.average());
    Ok(ScenarioOutcome {
        name: "model output shape changes on call 2",
        detail: match &outcome {
            Ok(_) => "run completed".to_string(),
            Err(e) => e.to_string(),
        },
        evaluations: calls.load(Ordering::SeqCst),
        passed: matches!(outcome, Err(AveragingError::ModelEvaluation { call: 2, .. })),
    })
}

fn run_scenarios() -> Result<(), String> {
    let scenarios: [fn() -> Result<ScenarioOutcome, String>; 6] = [
        scenario_paired_linear,
        scenario_gaussian_constant,
        scenario_uniform_vs_grid,
        scenario_tolerance_sweep,
        scenario_heavy_density,
        scenario_shape_change,
    ];

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Scenario", "Outcome", "Evaluations", "Status"]);
    let mut failed = 0usize;
    for scenario in scenarios {
        let outcome = scenario()?;
        info!("scenario '{}': passed = {}", outcome.name, outcome.passed);
        if !outcome.passed {
            failed += 1;
        }
        table.add_row(Row::from(vec![
            Cell::new(outcome.name),
            Cell::new(outcome.detail),
            Cell::new(outcome.evaluations),
            Cell::new(if outcome.passed { "ok" } else { "FAILED" }),
        ]));
    }
    println!("{table}");
    if failed > 0 {
        return Err(format!("{failed} scenario(s) failed"));
    }
    Ok(())
}
