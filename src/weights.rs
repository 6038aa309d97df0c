//! Probability densities for parameter averaging and their registry.
//!
//! Densities are supplied, never fitted. Each one is checked at registration:
//! it is integrated over its full declared support with the independent 1-D
//! quadrature in [`crate::quadrature`] and must be non-negative wherever it was
//! sampled and integrate to one within the registry tolerance.

use crate::error::AveragingError;
use crate::probability::{exponential_pdf, gaussian_pdf, log_normal_pdf};
use crate::quadrature::{Quad1dOptions, Quad1dResult, QuadratureContext, integrate_1d};
use crate::transform::{Domain, DomainTransform};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Default allowed deviation of a density's total mass from one.
pub const DEFAULT_NORMALIZATION_TOL: f64 = 0.01;

pub type DensityFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// A one-dimensional probability density with a declared support.
///
/// `center` and `scale` describe where the bulk of the mass sits. They only
/// steer the variable transforms used to integrate over unbounded supports.
#[derive(Clone)]
pub struct WeightFunction {
    name: String,
    support: Domain,
    density: DensityFn,
    center: f64,
    scale: f64,
}

impl fmt::Debug for WeightFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightFunction")
            .field("name", &self.name)
            .field("support", &self.support)
            .field("center", &self.center)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

impl WeightFunction {
    /// Wraps an arbitrary density. The closure is only called inside `support`.
    pub fn custom<F>(name: &str, support: Domain, density: F) -> Result<Self, AveragingError>
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        support
            .validate()
            .map_err(|e| AveragingError::weight(name, format!("unusable support: {e}")))?;
        let (lo, hi) = support.bounds();
        let center = match (lo.is_finite(), hi.is_finite()) {
            (true, true) => 0.5 * (lo + hi),
            (true, false) => lo,
            (false, true) => hi,
            (false, false) => 0.0,
        };
        Ok(Self {
            name: name.to_string(),
            support,
            density: Arc::new(density),
            center,
            scale: 1.0,
        })
    }

    /// Constant density `1 / (hi - lo)` on `[lo, hi]`.
    pub fn uniform(lo: f64, hi: f64) -> Result<Self, AveragingError> {
        let height = 1.0 / (hi - lo);
        Self::custom("uniform", Domain::finite(lo, hi), move |_| height)
    }

    pub fn normal(mean: f64, sd: f64) -> Result<Self, AveragingError> {
        if !(mean.is_finite() && sd.is_finite() && sd > 0.0) {
            return Err(AveragingError::weight(
                "normal",
                format!("requires finite mean and positive sd, got mean={mean}, sd={sd}"),
            ));
        }
        Self::custom("normal", Domain::Real, move |x| gaussian_pdf(x, mean, sd))?
            .with_hint(mean, sd)
    }

    /// Log-normal on `[0, ∞)`; `mu` and `sigma` parameterize `ln x`.
    pub fn log_normal(mu: f64, sigma: f64) -> Result<Self, AveragingError> {
        if !(mu.is_finite() && sigma.is_finite() && sigma > 0.0) {
            return Err(AveragingError::weight(
                "log_normal",
                format!("requires finite mu and positive sigma, got mu={mu}, sigma={sigma}"),
            ));
        }
        Self::custom("log_normal", Domain::lower_bounded(0.0), move |x| {
            log_normal_pdf(x, mu, sigma)
        })?
        .with_hint(0.0, mu.exp())
    }

    pub fn exponential(rate: f64) -> Result<Self, AveragingError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(AveragingError::weight(
                "exponential",
                format!("requires a positive rate, got {rate}"),
            ));
        }
        Self::custom("exponential", Domain::lower_bounded(0.0), move |x| {
            exponential_pdf(x, rate)
        })?
        .with_hint(0.0, 1.0 / rate)
    }

    /// Overrides where the bulk of the mass is expected.
    pub fn with_hint(mut self, center: f64, scale: f64) -> Result<Self, AveragingError> {
        if !(center.is_finite() && scale.is_finite() && scale > 0.0) {
            return Err(AveragingError::weight(
                &self.name,
                format!("invalid location hint center={center}, scale={scale}"),
            ));
        }
        self.center = center;
        self.scale = scale;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn support(&self) -> Domain {
        self.support
    }

    pub fn center(&self) -> f64 {
        self.center
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Density at `x`; zero outside the support.
    #[inline]
    pub fn evaluate(&self, x: f64) -> f64 {
        if self.support.contains(x) {
            (self.density)(x)
        } else {
            0.0
        }
    }
}

/// Outcome of the normalization check for one registered density.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizationReport {
    pub parameter: String,
    pub weight: String,
    /// ∫ density over the full declared support.
    pub support_mass: f64,
    /// Quadrature error estimate of `support_mass`.
    pub quadrature_error: f64,
    /// `support_mass - 1`.
    pub drift: f64,
    pub evaluations: usize,
}

#[derive(Debug)]
struct RegisteredWeight {
    parameter: String,
    weight: WeightFunction,
    report: NormalizationReport,
}

/// Independent per-parameter densities, combined multiplicatively.
#[derive(Debug)]
pub struct WeightRegistry {
    entries: Vec<RegisteredWeight>,
    normalization_tol: f64,
    ctx: QuadratureContext,
}

impl Default for WeightRegistry {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            normalization_tol: DEFAULT_NORMALIZATION_TOL,
            ctx: QuadratureContext::new(),
        }
    }
}

impl WeightRegistry {
    pub fn new(normalization_tol: f64) -> Result<Self, AveragingError> {
        if !(normalization_tol.is_finite() && normalization_tol > 0.0) {
            return Err(AveragingError::InvalidConfig(format!(
                "normalization tolerance must be positive and finite, got {normalization_tol}"
            )));
        }
        Ok(Self {
            normalization_tol,
            ..Self::default()
        })
    }

    pub fn normalization_tol(&self) -> f64 {
        self.normalization_tol
    }

    /// Registers `weight` for `parameter` after checking its normalization.
    pub fn register(
        &mut self,
        parameter: &str,
        weight: WeightFunction,
    ) -> Result<NormalizationReport, AveragingError> {
        if parameter.is_empty() {
            return Err(AveragingError::weight(parameter, "parameter name is empty"));
        }
        if self.entries.iter().any(|e| e.parameter == parameter) {
            return Err(AveragingError::weight(
                parameter,
                "a weight is already registered for this parameter",
            ));
        }

        let quad = self.integrate_density(parameter, &weight, weight.support())?;
        let drift = quad.value - 1.0;
        if drift.abs() > self.normalization_tol {
            return Err(AveragingError::weight(
                parameter,
                format!(
                    "'{}' integrates to {:.6} over its support, outside the allowed ±{} around 1",
                    weight.name(),
                    quad.value,
                    self.normalization_tol
                ),
            ));
        }

        let report = NormalizationReport {
            parameter: parameter.to_string(),
            weight: weight.name().to_string(),
            support_mass: quad.value,
            quadrature_error: quad.error,
            drift,
            evaluations: quad.evaluations,
        };
        log::debug!(
            "registered weight '{}' for '{}': mass {:.10} ({} evaluations)",
            report.weight,
            parameter,
            report.support_mass,
            report.evaluations
        );
        self.entries.push(RegisteredWeight {
            parameter: parameter.to_string(),
            weight,
            report: report.clone(),
        });
        Ok(report)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, parameter: &str) -> bool {
        self.position(parameter).is_some()
    }

    pub fn weight(&self, parameter: &str) -> Option<&WeightFunction> {
        self.position(parameter).map(|i| &self.entries[i].weight)
    }

    pub fn reports(&self) -> impl Iterator<Item = &NormalizationReport> {
        self.entries.iter().map(|e| &e.report)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.parameter.as_str())
    }

    fn position(&self, parameter: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.parameter == parameter)
    }

    /// Density registered for `parameter`, evaluated at `value`.
    pub fn density(&self, parameter: &str, value: f64) -> Result<f64, AveragingError> {
        self.weight(parameter)
            .map(|w| w.evaluate(value))
            .ok_or_else(|| AveragingError::weight(parameter, "no weight registered"))
    }

    /// Product of the registered densities over a parameter vector.
    ///
    /// Parameters without a registered weight contribute a factor of one. A
    /// factor that is negative or non-finite is `InvalidWeight`.
    pub fn joint_density(&self, names: &[&str], values: &[f64]) -> Result<f64, AveragingError> {
        if names.len() != values.len() {
            return Err(AveragingError::DimensionMismatch {
                expected: names.len(),
                found: values.len(),
            });
        }
        let lookup = self.lookup(names);
        self.joint_density_indexed(&lookup, values)
    }

    pub(crate) fn lookup(&self, names: &[&str]) -> Vec<Option<usize>> {
        names.iter().map(|n| self.position(n)).collect()
    }

    pub(crate) fn joint_density_indexed(
        &self,
        lookup: &[Option<usize>],
        values: &[f64],
    ) -> Result<f64, AveragingError> {
        let mut joint = 1.0;
        for (slot, &v) in lookup.iter().zip(values) {
            let Some(i) = *slot else { continue };
            let entry = &self.entries[i];
            let d = entry.weight.evaluate(v);
            if d < 0.0 || !d.is_finite() {
                return Err(AveragingError::weight(
                    &entry.parameter,
                    format!("'{}' evaluates to {d} at {v}", entry.weight.name()),
                ));
            }
            joint *= d;
        }
        Ok(joint)
    }

    /// Mass of the density for `parameter` that falls inside `bounds`.
    pub fn mass_within(&self, parameter: &str, bounds: Domain) -> Result<f64, AveragingError> {
        let weight = self
            .weight(parameter)
            .ok_or_else(|| AveragingError::weight(parameter, "no weight registered"))?;
        bounds.validate()?;
        match weight.support().intersect(&bounds) {
            Some(domain) => Ok(self.integrate_density(parameter, weight, domain)?.value),
            None => Ok(0.0),
        }
    }

    fn integrate_density(
        &self,
        parameter: &str,
        weight: &WeightFunction,
        domain: Domain,
    ) -> Result<Quad1dResult, AveragingError> {
        let transform = DomainTransform::for_domain(domain)?
            .with_scaling(weight.center(), weight.scale())?;
        let (a, b) = transform.canonical_bounds();

        let mut offending: Option<(f64, f64)> = None;
        let quad = integrate_1d(
            &self.ctx,
            |t| {
                let p = transform.to_physical(t);
                let d = weight.evaluate(p);
                if (d < 0.0 || !d.is_finite()) && offending.is_none() {
                    offending = Some((p, d));
                }
                d * transform.jacobian(t)
            },
            a,
            b,
            &Quad1dOptions::default(),
        );

        if let Some((p, d)) = offending {
            return Err(AveragingError::weight(
                parameter,
                format!("'{}' evaluates to {d} at {p}", weight.name()),
            ));
        }
        if !quad.value.is_finite() {
            return Err(AveragingError::weight(
                parameter,
                format!("'{}' has a non-finite integral", weight.name()),
            ));
        }
        Ok(quad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn builtin_densities_are_normalized() {
        let mut reg = WeightRegistry::default();
        let cases = [
            ("a", WeightFunction::uniform(-2.0, 3.0).unwrap()),
            ("b", WeightFunction::normal(500.0, 10.0).unwrap()),
            ("c", WeightFunction::log_normal(40f64.ln(), 0.2).unwrap()),
            ("d", WeightFunction::exponential(0.25).unwrap()),
        ];
        for (name, w) in cases {
            let report = reg.register(name, w).unwrap();
            assert!(report.drift.abs() < 1e-8, "{name}: drift {}", report.drift);
        }
    }

    #[test]
    fn rejects_density_with_mass_one_and_a_half() {
        let mut reg = WeightRegistry::default();
        let w = WeightFunction::custom("too_heavy", Domain::finite(0.0, 1.0), |_| 1.5).unwrap();
        let err = reg.register("x", w).unwrap_err();
        assert!(matches!(err, AveragingError::InvalidWeight { .. }));
        assert!(!reg.contains("x"));
    }

    #[test]
    fn rejects_negative_density() {
        let mut reg = WeightRegistry::default();
        // Integrates to one but dips below zero.
        let w = WeightFunction::custom("signed", Domain::finite(0.0, 1.0), |x| {
            1.0 + 3.0 * (x - 0.5)
        })
        .unwrap();
        let err = reg.register("x", w).unwrap_err();
        assert!(matches!(err, AveragingError::InvalidWeight { .. }));
    }

    #[test]
    fn accepts_small_drift_inside_tolerance() {
        let mut reg = WeightRegistry::default();
        let w = WeightFunction::custom("almost", Domain::finite(0.0, 1.0), |_| 1.005).unwrap();
        let report = reg.register("x", w).unwrap();
        assert_relative_eq!(report.drift, 0.005, epsilon = 1e-10);
    }

    #[test]
    fn rejects_duplicate_and_unknown_parameters() {
        let mut reg = WeightRegistry::default();
        reg.register("size", WeightFunction::uniform(0.0, 1.0).unwrap())
            .unwrap();
        assert!(
            reg.register("size", WeightFunction::uniform(0.0, 2.0).unwrap())
                .is_err()
        );
        assert!(matches!(
            reg.density("angle", 0.3),
            Err(AveragingError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn invalid_builtin_parameters_are_rejected() {
        assert!(WeightFunction::normal(0.0, 0.0).is_err());
        assert!(WeightFunction::uniform(1.0, 1.0).is_err());
        assert!(WeightFunction::log_normal(0.0, -1.0).is_err());
        assert!(WeightFunction::exponential(f64::NAN).is_err());
    }

    #[test]
    fn joint_density_is_product_of_registered_factors() {
        let mut reg = WeightRegistry::default();
        reg.register("a", WeightFunction::uniform(0.0, 2.0).unwrap())
            .unwrap();
        reg.register("b", WeightFunction::normal(0.0, 1.0).unwrap())
            .unwrap();
        let joint = reg.joint_density(&["a", "b", "free"], &[1.0, 0.0, 7.0]).unwrap();
        assert_relative_eq!(joint, 0.5 * crate::probability::normal_pdf(0.0));
        assert!(matches!(
            reg.joint_density(&["a"], &[1.0, 2.0]),
            Err(AveragingError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn joint_density_rejects_negative_value_missed_at_registration() {
        let mut reg = WeightRegistry::default();
        let w = WeightFunction::custom("spiked", Domain::finite(0.0, 1.0), |x| {
            if (x - 0.5).abs() < 1e-9 { -50.0 } else { 1.0 }
        })
        .unwrap();
        reg.register("x", w).unwrap();
        assert_relative_eq!(reg.joint_density(&["x"], &[0.25]).unwrap(), 1.0);
        assert!(matches!(
            reg.joint_density(&["x"], &[0.5]),
            Err(AveragingError::InvalidWeight { ref parameter, .. }) if parameter == "x"
        ));
    }

    #[test]
    fn mass_within_reports_truncation_loss() {
        let mut reg = WeightRegistry::default();
        reg.register("x", WeightFunction::normal(0.0, 1.0).unwrap())
            .unwrap();
        let inside = reg.mass_within("x", Domain::finite(-1.0, 1.0)).unwrap();
        assert_relative_eq!(inside, 0.682_689_492_137, max_relative = 1e-8);
        let half = reg.mass_within("x", Domain::lower_bounded(0.0)).unwrap();
        assert_relative_eq!(half, 0.5, max_relative = 1e-8);
        let none = reg.mass_within("x", Domain::finite(1e3, 2e3)).unwrap();
        assert!(none < 1e-12);
    }
}
