//! Averaging of a spectrum model over weighted parameter distributions.
//!
//! An [`Averager`] ties together the parameter domains, their transforms, the
//! weight registry and the model, runs the cubature engine once, and reshapes
//! the flat integral into a wavelength × channel table. The same setup can be
//! evaluated on a brute-force midpoint grid for comparison.

use crate::cubature::{ErrorNorm, VectorIntegrand, integrate};
use crate::error::AveragingError;
use crate::integrand::{ChannelSelection, SpectrumIntegrand};
use crate::model::{ChannelTag, SpectrumModel};
use crate::transform::{Domain, DomainTransform, TransformKind};
use crate::types::{AveragingConfig, Normalization};
use crate::weights::WeightRegistry;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Physical role of a parameter. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterMeaning {
    Size,
    ShapeRatio,
    Distance,
    Angle,
    #[default]
    Other,
}

/// One dimension of the parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub domain: Domain,
    #[serde(default)]
    pub meaning: ParameterMeaning,
    /// Overrides the transform implied by `domain`.
    #[serde(default)]
    pub transform: Option<TransformKind>,
    /// Finite box used by the naive grid when `domain` is unbounded.
    #[serde(default)]
    pub grid_bounds: Option<(f64, f64)>,
    /// Transform center; defaults to the registered weight's hint.
    #[serde(default)]
    pub center: Option<f64>,
    /// Transform length scale; defaults to the registered weight's hint.
    #[serde(default)]
    pub scale: Option<f64>,
}

impl ParameterSpec {
    pub fn new(name: &str, domain: Domain) -> Self {
        Self {
            name: name.to_string(),
            domain,
            meaning: ParameterMeaning::default(),
            transform: None,
            grid_bounds: None,
            center: None,
            scale: None,
        }
    }

    pub fn with_meaning(mut self, meaning: ParameterMeaning) -> Self {
        self.meaning = meaning;
        self
    }

    pub fn with_transform(mut self, kind: TransformKind) -> Self {
        self.transform = Some(kind);
        self
    }

    pub fn with_grid_bounds(mut self, lo: f64, hi: f64) -> Self {
        self.grid_bounds = Some((lo, hi));
        self
    }

    pub fn with_scaling(mut self, center: f64, scale: f64) -> Self {
        self.center = Some(center);
        self.scale = Some(scale);
        self
    }

    fn grid_domain(&self) -> Result<Domain, AveragingError> {
        let domain = match self.grid_bounds {
            Some((lo, hi)) => Domain::finite(lo, hi),
            None if self.domain.is_bounded() => self.domain,
            None => {
                return Err(AveragingError::InvalidDomain(format!(
                    "parameter '{}' has unbounded domain {:?} and no grid bounds",
                    self.name, self.domain
                )));
            }
        };
        domain.validate()?;
        Ok(domain)
    }
}

/// Share of a parameter's weight that lies inside its integration domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMass {
    pub parameter: String,
    pub mass: f64,
}

/// Weighted-average spectrum with per-value error estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AveragedSpectrum {
    pub wavelengths: Array1<f64>,
    pub channels: Vec<ChannelTag>,
    /// Rows are wavelengths, columns follow `channels`.
    pub values: Array2<f64>,
    pub errors: Array2<f64>,
    /// Integrand evaluations spent by the cubature engine.
    pub evaluations: usize,
    /// Model calls, including the shape call.
    pub model_calls: usize,
    pub regions: usize,
    pub converged: bool,
    pub relative_tol: f64,
    pub error_norm: ErrorNorm,
    pub normalization: Normalization,
    pub mass_within: Vec<ParameterMass>,
    pub warnings: Vec<String>,
}

fn column_of<'a>(
    channels: &[ChannelTag],
    values: &'a Array2<f64>,
    tag: ChannelTag,
) -> Option<ArrayView1<'a, f64>> {
    channels
        .iter()
        .position(|c| *c == tag)
        .map(|i| values.column(i))
}

impl AveragedSpectrum {
    pub fn channel(&self, tag: ChannelTag) -> Option<ArrayView1<'_, f64>> {
        column_of(&self.channels, &self.values, tag)
    }

    pub fn channel_error(&self, tag: ChannelTag) -> Option<ArrayView1<'_, f64>> {
        column_of(&self.channels, &self.errors, tag)
    }

    /// Largest absolute deviation from a grid average of the same layout.
    pub fn max_abs_difference(&self, naive: &NaiveAverage) -> Result<f64, AveragingError> {
        if self.channels != naive.channels || self.values.dim() != naive.values.dim() {
            return Err(AveragingError::DimensionMismatch {
                expected: self.values.len(),
                found: naive.values.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(naive.values.iter())
            .fold(0.0f64, |acc, (a, b)| acc.max((a - b).abs())))
    }
}

/// How the naive grid combines its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GridWeighting {
    /// Arithmetic mean over the nodes.
    #[default]
    Unweighted,
    /// Mean weighted by the joint density at each node.
    Density,
}

/// Brute-force midpoint-grid average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveAverage {
    pub wavelengths: Array1<f64>,
    pub channels: Vec<ChannelTag>,
    pub values: Array2<f64>,
    pub evaluations: usize,
}

impl NaiveAverage {
    pub fn channel(&self, tag: ChannelTag) -> Option<ArrayView1<'_, f64>> {
        column_of(&self.channels, &self.values, tag)
    }
}

fn resolve_error_norm(
    requested: ErrorNorm,
    selection: &ChannelSelection,
) -> Result<ErrorNorm, AveragingError> {
    let grouped = selection.error_norm();
    match requested {
        ErrorNorm::Individual => Ok(grouped),
        ErrorNorm::L1 | ErrorNorm::L2 | ErrorNorm::Linf => Ok(requested),
        n if n == grouped || n == ErrorNorm::Grouped(selection.group_size()) => Ok(grouped),
        n => Err(AveragingError::InvalidConfig(format!(
            "error norm {n:?} does not match channel groups of size {}",
            selection.group_size()
        ))),
    }
}

fn reshape(flat: &Array1<f64>, n_w: usize, n_ch: usize, factor: f64) -> Array2<f64> {
    Array2::from_shape_fn((n_w, n_ch), |(w, c)| flat[w * n_ch + c] * factor)
}

/// A fully validated averaging problem.
pub struct Averager<'a, M: SpectrumModel + ?Sized> {
    params: Vec<ParameterSpec>,
    transforms: Vec<DomainTransform>,
    masses: Vec<Option<f64>>,
    registry: &'a WeightRegistry,
    model: &'a M,
    selection: ChannelSelection,
    config: AveragingConfig,
    error_norm: ErrorNorm,
}

impl<'a, M: SpectrumModel + ?Sized> Averager<'a, M> {
    pub fn new(
        params: Vec<ParameterSpec>,
        registry: &'a WeightRegistry,
        model: &'a M,
        selection: ChannelSelection,
        config: AveragingConfig,
    ) -> Result<Self, AveragingError> {
        if params.is_empty() {
            return Err(AveragingError::InvalidConfig(
                "at least one parameter is required".to_string(),
            ));
        }
        for (i, p) in params.iter().enumerate() {
            if p.name.trim().is_empty() {
                return Err(AveragingError::InvalidConfig(format!(
                    "parameter {i} has an empty name"
                )));
            }
            if params[..i].iter().any(|q| q.name == p.name) {
                return Err(AveragingError::InvalidConfig(format!(
                    "parameter '{}' is declared twice",
                    p.name
                )));
            }
        }
        config.cubature.validate()?;
        let error_norm = resolve_error_norm(config.cubature.error_norm, &selection)?;

        let weighted = config.normalization != Normalization::UniformMean;
        let mut transforms = Vec::with_capacity(params.len());
        let mut masses = Vec::with_capacity(params.len());
        for p in &params {
            p.domain.validate()?;
            if !weighted && !p.domain.is_bounded() {
                return Err(AveragingError::InvalidDomain(format!(
                    "a uniform mean needs finite bounds, parameter '{}' has {:?}",
                    p.name, p.domain
                )));
            }
            let weight = if weighted { registry.weight(&p.name) } else { None };
            let kind = p
                .transform
                .unwrap_or_else(|| TransformKind::natural_for(&p.domain));
            let center = p.center.or(weight.map(|w| w.center())).unwrap_or(0.0);
            let scale = p.scale.or(weight.map(|w| w.scale())).unwrap_or(1.0);
            transforms.push(DomainTransform::new(kind, p.domain)?.with_scaling(center, scale)?);
            masses.push(match weight {
                Some(_) => Some(registry.mass_within(&p.name, p.domain)?),
                None => None,
            });
        }

        if config.normalization == Normalization::TruncatedExpectation {
            if let Some((p, _)) = params
                .iter()
                .zip(&masses)
                .find(|(_, m)| matches!(m, Some(m) if *m <= 0.0))
            {
                return Err(AveragingError::weight(
                    &p.name,
                    "no weight mass inside the integration domain",
                ));
            }
        }

        Ok(Self {
            params,
            transforms,
            masses,
            registry,
            model,
            selection,
            config,
            error_norm,
        })
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.params
    }

    pub fn error_norm(&self) -> ErrorNorm {
        self.error_norm
    }

    fn names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    /// Factor that turns the raw integral into the requested average.
    fn normalization_factor(&self) -> f64 {
        match self.config.normalization {
            Normalization::Expectation => 1.0,
            Normalization::UniformMean => {
                let volume: f64 = self
                    .params
                    .iter()
                    .filter_map(|p| p.domain.width())
                    .product();
                1.0 / volume
            }
            Normalization::TruncatedExpectation => {
                let captured: f64 = self.masses.iter().flatten().product();
                1.0 / captured
            }
        }
    }

    fn collect_warnings(&self, converged: bool, evaluations: usize) -> Vec<String> {
        let rel = self.config.cubature.relative_tol;
        let mut warnings = Vec::new();
        for (p, mass) in self.params.iter().zip(&self.masses) {
            let Some(mass) = *mass else { continue };
            let Some(report) = self.registry.reports().find(|r| r.parameter == p.name) else {
                continue;
            };
            if report.drift.abs() > rel {
                warnings.push(format!(
                    "weight '{}' for '{}' integrates to {:.6} over its support (drift {:+.2e})",
                    report.weight, p.name, report.support_mass, report.drift
                ));
            }
            if self.config.normalization == Normalization::Expectation
                && report.support_mass - mass > rel * report.support_mass
            {
                warnings.push(format!(
                    "domain of '{}' captures only {:.6} of its weight; use TruncatedExpectation to renormalize",
                    p.name, mass
                ));
            }
        }
        if !converged {
            warnings.push(format!(
                "cubature stopped after {evaluations} evaluations without meeting relative tolerance {rel:e}"
            ));
        }
        warnings
    }

    /// Runs the adaptive cubature and returns the averaged spectrum.
    pub fn average(&self) -> Result<AveragedSpectrum, AveragingError> {
        let names = self.names();
        let weighted = self.config.normalization != Normalization::UniformMean;
        let integrand = SpectrumIntegrand::new(
            self.model,
            &names,
            self.transforms.clone(),
            self.registry,
            &self.selection,
            weighted,
        )?;
        let output_dim = integrand.prepare()?;
        let (lower, upper) = integrand.canonical_bounds();
        let opts = self.config.cubature.clone().with_error_norm(self.error_norm);
        let result = integrate(&integrand, &lower, &upper, output_dim, &opts)?;

        let wavelengths = integrand.wavelengths().cloned().ok_or_else(|| {
            AveragingError::InvalidConfig("model output shape was never recorded".to_string())
        })?;
        let channels = self.selection.channels();
        let factor = self.normalization_factor();
        let values = reshape(&result.integral, wavelengths.len(), channels.len(), factor);
        let errors = reshape(&result.error, wavelengths.len(), channels.len(), factor.abs());

        let warnings = self.collect_warnings(result.converged, result.evaluations);
        for w in &warnings {
            warn!("{w}");
        }
        debug!(
            "averaged {} channels over {} wavelengths in {}D: {} evaluations, {} regions, converged={}",
            channels.len(),
            wavelengths.len(),
            self.params.len(),
            result.evaluations,
            result.regions,
            result.converged
        );

        let mass_within = self
            .params
            .iter()
            .zip(&self.masses)
            .filter_map(|(p, m)| {
                m.map(|mass| ParameterMass {
                    parameter: p.name.clone(),
                    mass,
                })
            })
            .collect();

        Ok(AveragedSpectrum {
            wavelengths,
            channels,
            values,
            errors,
            evaluations: result.evaluations,
            model_calls: integrand.calls(),
            regions: result.regions,
            converged: result.converged,
            relative_tol: self.config.cubature.relative_tol,
            error_norm: self.error_norm,
            normalization: self.config.normalization,
            mass_within,
            warnings,
        })
    }

    /// Averages the model over a midpoint grid of `points_per_dim` nodes per
    /// parameter spanning each parameter's grid bounds.
    pub fn naive_grid_average(
        &self,
        points_per_dim: usize,
        weighting: GridWeighting,
    ) -> Result<NaiveAverage, AveragingError> {
        if points_per_dim == 0 {
            return Err(AveragingError::InvalidConfig(
                "naive grid needs at least one point per dimension".to_string(),
            ));
        }
        let dim = self.params.len();
        let nodes = u32::try_from(dim)
            .ok()
            .and_then(|d| points_per_dim.checked_pow(d))
            .ok_or_else(|| {
                AveragingError::InvalidConfig(format!(
                    "{points_per_dim}^{dim} grid nodes do not fit in memory"
                ))
            })?;
        let transforms = self
            .params
            .iter()
            .map(|p| p.grid_domain().and_then(DomainTransform::for_domain))
            .collect::<Result<Vec<_>, _>>()?;
        let volume: f64 = transforms
            .iter()
            .filter_map(|t| t.domain().width())
            .product();

        let names = self.names();
        let integrand = SpectrumIntegrand::new(
            self.model,
            &names,
            transforms.clone(),
            self.registry,
            &self.selection,
            false,
        )?;

        let step = 1.0 / points_per_dim as f64;
        let mut index = vec![0usize; dim];
        let mut sum = Array1::<f64>::zeros(0);
        let mut total_weight = 0.0;
        for _ in 0..nodes {
            let t: Vec<f64> = index.iter().map(|&i| (i as f64 + 0.5) * step).collect();
            let out = integrand.evaluate(&t)?;
            let w = match weighting {
                GridWeighting::Unweighted => 1.0,
                GridWeighting::Density => {
                    let p: Vec<f64> = transforms
                        .iter()
                        .zip(&t)
                        .map(|(tr, &ti)| tr.to_physical(ti))
                        .collect();
                    self.registry.joint_density(&names, &p)?
                }
            };
            total_weight += w;
            if sum.is_empty() {
                sum = out * w;
            } else {
                sum.scaled_add(w, &out);
            }
            for slot in index.iter_mut() {
                *slot += 1;
                if *slot < points_per_dim {
                    break;
                }
                *slot = 0;
            }
        }

        if total_weight <= 0.0 {
            return Err(AveragingError::weight(
                &names.join(","),
                "joint density vanishes on every grid node",
            ));
        }
        let wavelengths = integrand.wavelengths().cloned().ok_or_else(|| {
            AveragingError::InvalidConfig("model output shape was never recorded".to_string())
        })?;
        let channels = self.selection.channels();
        let values = reshape(
            &sum,
            wavelengths.len(),
            channels.len(),
            1.0 / (total_weight * volume),
        );
        debug!(
            "naive {weighting:?} grid: {} model calls over {} nodes",
            integrand.calls(),
            nodes
        );
        Ok(NaiveAverage {
            wavelengths,
            channels,
            values,
            evaluations: integrand.calls(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelFailure, OutputKind, SpectrumSample};
    use crate::types::CubatureOptions;
    use crate::weights::WeightFunction;
    use approx::assert_relative_eq;
    use ndarray::array;

    const EXT_CS: ChannelTag = ChannelTag::cross_section(OutputKind::Extinction);
    const EXT_DC: ChannelTag = ChannelTag::dichroism(OutputKind::Extinction);

    fn oscillator(p: &[f64]) -> Result<SpectrumSample, ModelFailure> {
        let grid = array![1.0, 2.0];
        Ok(SpectrumSample::new(grid.clone())
            .with_channel(EXT_CS, grid.mapv(|w| (p[0] * w).sin()))
            .with_channel(EXT_DC, grid.mapv(|w| 0.1 * (p[0] * w).cos())))
    }

    fn constant(_: &[f64]) -> Result<SpectrumSample, ModelFailure> {
        Ok(SpectrumSample::new(array![550.0])
            .with_channel(EXT_CS, array![1.0])
            .with_channel(EXT_DC, array![1.0]))
    }

    fn paired() -> ChannelSelection {
        ChannelSelection::paired(&[OutputKind::Extinction]).unwrap()
    }

    fn config(relative_tol: f64, normalization: Normalization) -> AveragingConfig {
        AveragingConfig {
            cubature: CubatureOptions::default().with_relative_tol(relative_tol),
            normalization,
        }
    }

    #[test]
    fn uniform_weight_matches_closed_form_and_naive_grid() {
        let mut reg = WeightRegistry::default();
        reg.register("size", WeightFunction::uniform(0.0, 2.0).unwrap())
            .unwrap();
        let averager = Averager::new(
            vec![ParameterSpec::new("size", Domain::finite(0.0, 2.0))],
            &reg,
            &oscillator,
            paired(),
            config(1e-8, Normalization::Expectation),
        )
        .unwrap();
        let avg = averager.average().unwrap();
        assert!(avg.converged);
        assert!(avg.warnings.is_empty(), "{:?}", avg.warnings);
        assert_eq!(avg.model_calls, avg.evaluations + 1);
        for (i, &w) in [1.0f64, 2.0].iter().enumerate() {
            assert_relative_eq!(
                avg.values[[i, 0]],
                (1.0 - (2.0 * w).cos()) / (2.0 * w),
                max_relative = 1e-8
            );
            assert_relative_eq!(
                avg.values[[i, 1]],
                0.1 * (2.0 * w).sin() / (2.0 * w),
                max_relative = 1e-8
            );
        }

        let diffs: Vec<f64> = [4, 16, 64]
            .iter()
            .map(|&n| {
                let naive = averager
                    .naive_grid_average(n, GridWeighting::Unweighted)
                    .unwrap();
                assert_eq!(naive.evaluations, n);
                avg.max_abs_difference(&naive).unwrap()
            })
            .collect();
        assert!(diffs[0] > diffs[1] && diffs[1] > diffs[2], "{diffs:?}");
        assert!(diffs[2] < 1e-4);
    }

    #[test]
    fn normal_weight_over_the_real_line_returns_the_constant() {
        let mut reg = WeightRegistry::default();
        reg.register("x", WeightFunction::normal(0.0, 1.0).unwrap())
            .unwrap();
        let averager = Averager::new(
            vec![ParameterSpec::new("x", Domain::Real)],
            &reg,
            &constant,
            paired(),
            config(1e-6, Normalization::Expectation),
        )
        .unwrap();
        assert_eq!(averager.error_norm(), ErrorNorm::Paired);
        let avg = averager.average().unwrap();
        assert!(avg.converged);
        assert_relative_eq!(avg.values[[0, 0]], 1.0, max_relative = 1e-6);
        assert_relative_eq!(avg.values[[0, 1]], 1.0, max_relative = 1e-6);
        assert_eq!(avg.channel(EXT_DC).unwrap().len(), 1);
    }

    #[test]
    fn truncated_expectation_renormalizes_captured_mass() {
        let mut reg = WeightRegistry::default();
        reg.register("x", WeightFunction::normal(0.0, 1.0).unwrap())
            .unwrap();
        let params = vec![ParameterSpec::new("x", Domain::finite(-1.0, 1.0))];

        let plain = Averager::new(
            params.clone(),
            &reg,
            &constant,
            paired(),
            config(1e-6, Normalization::Expectation),
        )
        .unwrap()
        .average()
        .unwrap();
        assert_relative_eq!(plain.values[[0, 0]], 0.682_689_492_137, max_relative = 1e-8);
        assert_eq!(plain.warnings.len(), 1);
        assert!(plain.warnings[0].contains("captures only"));

        let renormalized = Averager::new(
            params,
            &reg,
            &constant,
            paired(),
            config(1e-6, Normalization::TruncatedExpectation),
        )
        .unwrap()
        .average()
        .unwrap();
        assert_relative_eq!(renormalized.values[[0, 0]], 1.0, max_relative = 1e-8);
        assert!(renormalized.warnings.is_empty());
        assert_relative_eq!(
            renormalized.mass_within[0].mass,
            0.682_689_492_137,
            max_relative = 1e-8
        );
    }

    #[test]
    fn uniform_mean_ignores_weights_and_divides_by_volume() {
        let mut reg = WeightRegistry::default();
        reg.register("x", WeightFunction::normal(0.0, 1.0).unwrap())
            .unwrap();
        let model = |p: &[f64]| -> Result<SpectrumSample, ModelFailure> {
            Ok(SpectrumSample::new(array![1.0]).with_channel(EXT_CS, array![p[0] * p[1]]))
        };
        let averager = Averager::new(
            vec![
                ParameterSpec::new("x", Domain::finite(0.0, 2.0)),
                ParameterSpec::new("y", Domain::finite(1.0, 4.0)),
            ],
            &reg,
            &model,
            ChannelSelection::single(vec![EXT_CS]).unwrap(),
            config(1e-8, Normalization::UniformMean),
        )
        .unwrap();
        let avg = averager.average().unwrap();
        // mean(x) * mean(y) = 1 * 2.5
        assert_relative_eq!(avg.values[[0, 0]], 2.5, max_relative = 1e-10);
        assert!(avg.mass_within.is_empty());

        let unbounded = Averager::new(
            vec![ParameterSpec::new("x", Domain::Real)],
            &reg,
            &model,
            ChannelSelection::single(vec![EXT_CS]).unwrap(),
            config(1e-4, Normalization::UniformMean),
        );
        assert!(matches!(unbounded, Err(AveragingError::InvalidDomain(_))));
    }

    #[test]
    fn rejects_malformed_parameter_lists() {
        let reg = WeightRegistry::default();
        let cfg = AveragingConfig::default();
        let dup = Averager::new(
            vec![
                ParameterSpec::new("a", Domain::finite(0.0, 1.0)),
                ParameterSpec::new("a", Domain::finite(0.0, 1.0)),
            ],
            &reg,
            &constant,
            paired(),
            cfg.clone(),
        );
        assert!(matches!(dup, Err(AveragingError::InvalidConfig(_))));
        let empty = Averager::new(vec![], &reg, &constant, paired(), cfg.clone());
        assert!(matches!(empty, Err(AveragingError::InvalidConfig(_))));
        let mismatched = Averager::new(
            vec![ParameterSpec::new("a", Domain::finite(0.0, 1.0)).with_transform(TransformKind::FullLine)],
            &reg,
            &constant,
            paired(),
            cfg,
        );
        assert!(matches!(mismatched, Err(AveragingError::InvalidDomain(_))));
    }

    #[test]
    fn grouped_norm_must_agree_with_the_selection() {
        let reg = WeightRegistry::default();
        let params = vec![ParameterSpec::new("a", Domain::finite(0.0, 1.0))];
        let mut cfg = AveragingConfig::default();
        cfg.cubature.error_norm = ErrorNorm::Grouped(3);
        assert!(Averager::new(params.clone(), &reg, &constant, paired(), cfg.clone()).is_err());
        cfg.cubature.error_norm = ErrorNorm::Grouped(2);
        let averager = Averager::new(params.clone(), &reg, &constant, paired(), cfg.clone()).unwrap();
        assert_eq!(averager.error_norm(), ErrorNorm::Paired);
        cfg.cubature.error_norm = ErrorNorm::Linf;
        let averager = Averager::new(params, &reg, &constant, paired(), cfg).unwrap();
        assert_eq!(averager.error_norm(), ErrorNorm::Linf);
    }

    #[test]
    fn naive_grid_needs_finite_bounds_and_points() {
        let mut reg = WeightRegistry::default();
        reg.register("x", WeightFunction::exponential(1.0).unwrap())
            .unwrap();
        let averager = Averager::new(
            vec![ParameterSpec::new("x", Domain::lower_bounded(0.0))],
            &reg,
            &constant,
            paired(),
            AveragingConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            averager.naive_grid_average(8, GridWeighting::Density),
            Err(AveragingError::InvalidDomain(_))
        ));
        assert!(matches!(
            averager.naive_grid_average(0, GridWeighting::Density),
            Err(AveragingError::InvalidConfig(_))
        ));

        let bounded = Averager::new(
            vec![ParameterSpec::new("x", Domain::lower_bounded(0.0)).with_grid_bounds(0.0, 20.0)],
            &reg,
            &constant,
            paired(),
            AveragingConfig::default(),
        )
        .unwrap();
        let naive = bounded.naive_grid_average(50, GridWeighting::Density).unwrap();
        assert_relative_eq!(naive.values[[0, 0]], 1.0, max_relative = 1e-12);
        assert_eq!(naive.channel(EXT_CS).unwrap()[0], naive.values[[0, 0]]);
    }

    #[test]
    fn two_dimensional_density_weighted_average() {
        let mut reg = WeightRegistry::default();
        reg.register("size", WeightFunction::normal(40.0, 4.0).unwrap())
            .unwrap();
        reg.register("angle", WeightFunction::uniform(0.0, 1.0).unwrap())
            .unwrap();
        let model = |p: &[f64]| -> Result<SpectrumSample, ModelFailure> {
            Ok(SpectrumSample::new(array![500.0, 600.0])
                .with_channel(EXT_CS, array![p[0], p[0] * p[0]])
                .with_channel(EXT_DC, array![p[1], p[0] * p[1]]))
        };
        let averager = Averager::new(
            vec![
                ParameterSpec::new("size", Domain::lower_bounded(0.0))
                    .with_meaning(ParameterMeaning::Size),
                ParameterSpec::new("angle", Domain::finite(0.0, 1.0))
                    .with_meaning(ParameterMeaning::Angle),
            ],
            &reg,
            &model,
            paired(),
            config(1e-7, Normalization::Expectation),
        )
        .unwrap();
        let avg = averager.average().unwrap();
        assert!(avg.converged, "{:?}", avg.warnings);
        let cs = avg.channel(EXT_CS).unwrap();
        let dc = avg.channel(EXT_DC).unwrap();
        assert_relative_eq!(cs[0], 40.0, max_relative = 1e-6);
        assert_relative_eq!(cs[1], 40.0 * 40.0 + 16.0, max_relative = 1e-6);
        assert_relative_eq!(dc[0], 0.5, max_relative = 1e-6);
        assert_relative_eq!(dc[1], 20.0, max_relative = 1e-6);
    }

    #[test]
    fn negative_density_reached_during_a_run_is_rejected() {
        let mut reg = WeightRegistry::default();
        let spiked = WeightFunction::custom("spiked", Domain::finite(0.0, 1.0), |x| {
            if (x - 0.5).abs() < 1e-9 { -50.0 } else { 1.0 }
        })
        .unwrap();
        reg.register("x", spiked).unwrap();
        let averager = Averager::new(
            vec![ParameterSpec::new("x", Domain::finite(0.0, 1.0))],
            &reg,
            &constant,
            paired(),
            config(1e-6, Normalization::Expectation),
        )
        .unwrap();
        match averager.average() {
            Err(AveragingError::InvalidWeight { parameter, reason }) => {
                assert_eq!(parameter, "x");
                assert!(reason.contains("-50"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn normalization_drift_is_reported_without_failing_the_run() {
        let mut reg = WeightRegistry::default();
        let almost = WeightFunction::custom("almost", Domain::finite(0.0, 1.0), |_| 1.005).unwrap();
        reg.register("x", almost).unwrap();
        let averager = Averager::new(
            vec![ParameterSpec::new("x", Domain::finite(0.0, 1.0))],
            &reg,
            &constant,
            paired(),
            config(1e-4, Normalization::Expectation),
        )
        .unwrap();
        let avg = averager.average().unwrap();
        assert!(avg.converged);
        assert_eq!(avg.warnings.len(), 1, "{:?}", avg.warnings);
        assert!(avg.warnings[0].contains("drift"), "{}", avg.warnings[0]);
        assert_relative_eq!(avg.values[[0, 0]], 1.005, max_relative = 1e-10);
    }
}
