//! Adapter from canonical cubature points to weighted spectrum vectors.

use crate::cubature::{ErrorNorm, VectorIntegrand};
use crate::error::AveragingError;
use crate::model::{ChannelTag, OutputKind, SpectrumModel, SpectrumSample};
use crate::transform::DomainTransform;
use crate::weights::WeightRegistry;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Channels to integrate, organised in equally sized error groups.
///
/// Each group shares one convergence test: with groups of two, the
/// cross-section and dichroism of the same wavelength are judged together by
/// their Euclidean error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSelection {
    groups: Vec<Vec<ChannelTag>>,
}

impl ChannelSelection {
    pub fn new(groups: Vec<Vec<ChannelTag>>) -> Result<Self, AveragingError> {
        let Some(first) = groups.first() else {
            return Err(AveragingError::InvalidConfig(
                "channel selection is empty".to_string(),
            ));
        };
        let size = first.len();
        if size == 0 || groups.iter().any(|g| g.len() != size) {
            return Err(AveragingError::InvalidConfig(format!(
                "all channel groups must have the same non-zero size, got sizes {:?}",
                groups.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        let flat: Vec<ChannelTag> = groups.iter().flatten().copied().collect();
        for (i, tag) in flat.iter().enumerate() {
            if flat[..i].contains(tag) {
                return Err(AveragingError::InvalidConfig(format!(
                    "channel {tag} selected more than once"
                )));
            }
        }
        Ok(Self { groups })
    }

    /// Every channel judged on its own.
    pub fn single(tags: Vec<ChannelTag>) -> Result<Self, AveragingError> {
        Self::new(tags.into_iter().map(|t| vec![t]).collect())
    }

    /// `[cross-section, dichroism]` pairs, one per output kind.
    pub fn paired(kinds: &[OutputKind]) -> Result<Self, AveragingError> {
        Self::new(
            kinds
                .iter()
                .map(|&k| vec![ChannelTag::cross_section(k), ChannelTag::dichroism(k)])
                .collect(),
        )
    }

    pub fn group_size(&self) -> usize {
        self.groups[0].len()
    }

    /// Selected channels in output order within one wavelength.
    pub fn channels(&self) -> Vec<ChannelTag> {
        self.groups.iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len() * self.group_size()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn error_norm(&self) -> ErrorNorm {
        ErrorNorm::for_group_size(self.group_size())
    }
}

/// Shape fixed by the first model evaluation of a run.
#[derive(Debug, Clone)]
struct SampleShape {
    wavelengths: Array1<f64>,
    tags: Vec<ChannelTag>,
    /// Position in `SpectrumSample::channels` of every selected channel.
    selected: Vec<usize>,
}

fn grids_match(a: &Array1<f64>, b: &Array1<f64>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= 1e-12 * x.abs().max(y.abs()).max(1.0))
}

/// Weighted spectrum as a function of canonical coordinates.
///
/// At a canonical point `t` it maps every coordinate to its physical value,
/// runs the model, and returns every selected channel multiplied by
/// `joint_density(p) * Π jacobian(t)`, laid out wavelength-major so that each
/// wavelength's error group is contiguous.
pub struct SpectrumIntegrand<'a, M: SpectrumModel + ?Sized> {
    model: &'a M,
    transforms: Vec<DomainTransform>,
    registry: &'a WeightRegistry,
    lookup: Vec<Option<usize>>,
    apply_weights: bool,
    channels: Vec<ChannelTag>,
    shape: OnceLock<SampleShape>,
    calls: AtomicUsize,
}

impl<'a, M: SpectrumModel + ?Sized> SpectrumIntegrand<'a, M> {
    /// `names[i]` and `transforms[i]` describe parameter `i`. When
    /// `apply_weights` is false every density factor is one.
    pub fn new(
        model: &'a M,
        names: &[&str],
        transforms: Vec<DomainTransform>,
        registry: &'a WeightRegistry,
        selection: &ChannelSelection,
        apply_weights: bool,
    ) -> Result<Self, AveragingError> {
        if names.is_empty() || names.len() != transforms.len() {
            return Err(AveragingError::InvalidConfig(format!(
                "{} parameter names for {} transforms",
                names.len(),
                transforms.len()
            )));
        }
        Ok(Self {
            model,
            lookup: registry.lookup(names),
            transforms,
            registry,
            apply_weights,
            channels: selection.channels(),
            shape: OnceLock::new(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn dim(&self) -> usize {
        self.transforms.len()
    }

    /// Lower and upper canonical corners of the integration box.
    pub fn canonical_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.transforms.iter().map(|t| t.canonical_bounds()).unzip()
    }

    /// Evaluates the model once at the canonical center to fix the output
    /// shape, and returns the integrand's output dimension.
    pub fn prepare(&self) -> Result<usize, AveragingError> {
        let (lo, hi) = self.canonical_bounds();
        let center: Vec<f64> = lo.iter().zip(&hi).map(|(a, b)| 0.5 * (a + b)).collect();
        self.evaluate(&center)?;
        Ok(self.output_dim())
    }

    /// Zero until the first model evaluation.
    pub fn output_dim(&self) -> usize {
        self.shape
            .get()
            .map(|s| s.wavelengths.len() * self.channels.len())
            .unwrap_or(0)
    }

    pub fn wavelengths(&self) -> Option<&Array1<f64>> {
        self.shape.get().map(|s| &s.wavelengths)
    }

    pub fn channels(&self) -> &[ChannelTag] {
        &self.channels
    }

    /// Model calls made so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn build_shape(&self, call: usize, sample: &SpectrumSample) -> Result<SampleShape, AveragingError> {
        let mut selected = Vec::with_capacity(self.channels.len());
        for tag in &self.channels {
            let idx = sample
                .channels
                .iter()
                .position(|c| c.tag == *tag)
                .ok_or_else(|| AveragingError::ModelEvaluation {
                    call,
                    reason: format!("selected channel {tag} is missing from the model output"),
                })?;
            selected.push(idx);
        }
        Ok(SampleShape {
            wavelengths: sample.wavelengths.clone(),
            tags: sample.tags(),
            selected,
        })
    }

    fn check_shape(
        &self,
        call: usize,
        shape: &SampleShape,
        sample: &SpectrumSample,
    ) -> Result<(), AveragingError> {
        let fail = |reason: String| AveragingError::ModelEvaluation { call, reason };
        if !grids_match(&shape.wavelengths, &sample.wavelengths) {
            return Err(fail(format!(
                "wavelength grid changed: expected {} points, got {}",
                shape.wavelengths.len(),
                sample.wavelengths.len()
            )));
        }
        if sample.channels.len() != shape.tags.len()
            || sample.channels.iter().zip(&shape.tags).any(|(c, t)| c.tag != *t)
        {
            return Err(fail(format!(
                "channel set changed: expected {:?}, got {:?}",
                shape.tags,
                sample.tags()
            )));
        }
        if let Some(c) = sample
            .channels
            .iter()
            .find(|c| c.values.len() != shape.wavelengths.len())
        {
            return Err(fail(format!(
                "channel {} has {} values for {} wavelengths",
                c.tag,
                c.values.len(),
                shape.wavelengths.len()
            )));
        }
        Ok(())
    }
}

impl<M: SpectrumModel + ?Sized> VectorIntegrand for SpectrumIntegrand<'_, M> {
    fn evaluate(&self, t: &[f64]) -> Result<Array1<f64>, AveragingError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if t.len() != self.transforms.len() {
            return Err(AveragingError::DimensionMismatch {
                expected: self.transforms.len(),
                found: t.len(),
            });
        }

        let mut physical = Vec::with_capacity(t.len());
        let mut jacobian = 1.0;
        for (tr, &ti) in self.transforms.iter().zip(t) {
            physical.push(tr.to_physical(ti));
            jacobian *= tr.jacobian(ti);
        }

        let sample = self
            .model
            .evaluate(&physical)
            .map_err(|e| AveragingError::ModelEvaluation {
                call,
                reason: e.to_string(),
            })?;

        let shape = match self.shape.get() {
            Some(shape) => shape,
            None => {
                let built = self.build_shape(call, &sample)?;
                // Another worker may have won the race; its shape is authoritative.
                let _ = self.shape.set(built);
                self.shape.get().ok_or_else(|| AveragingError::ModelEvaluation {
                    call,
                    reason: "sample shape could not be recorded".to_string(),
                })?
            }
        };
        self.check_shape(call, shape, &sample)?;

        let density = if self.apply_weights {
            self.registry.joint_density_indexed(&self.lookup, &physical)?
        } else {
            1.0
        };
        let factor = density * jacobian;

        let n_ch = shape.selected.len();
        let mut out = Array1::<f64>::zeros(shape.wavelengths.len() * n_ch);
        if factor != 0.0 {
            for (c, &idx) in shape.selected.iter().enumerate() {
                let values = &sample.channels[idx].values;
                for (w, &v) in values.iter().enumerate() {
                    out[w * n_ch + c] = v * factor;
                }
            }
        }
        if let Some(bad) = out.iter().position(|v| !v.is_finite()) {
            return Err(AveragingError::ModelEvaluation {
                call,
                reason: format!(
                    "non-finite weighted value at output {bad} for parameters {physical:?}"
                ),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelFailure, Quantity};
    use crate::transform::Domain;
    use crate::weights::WeightFunction;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn two_channel_model(p: &[f64]) -> Result<SpectrumSample, ModelFailure> {
        Ok(SpectrumSample::new(array![500.0, 600.0])
            .with_channel(
                ChannelTag::cross_section(OutputKind::Extinction),
                array![p[0], 2.0 * p[0]],
            )
            .with_channel(
                ChannelTag::dichroism(OutputKind::Extinction),
                array![-p[0], 0.5],
            ))
    }

    #[test]
    fn selection_rejects_mixed_group_sizes_and_duplicates() {
        let cs = ChannelTag::cross_section(OutputKind::Absorption);
        let dc = ChannelTag::dichroism(OutputKind::Absorption);
        assert!(ChannelSelection::new(vec![vec![cs, dc], vec![cs]]).is_err());
        assert!(ChannelSelection::new(vec![]).is_err());
        assert!(ChannelSelection::single(vec![cs, cs]).is_err());
        let paired = ChannelSelection::paired(&[OutputKind::Absorption]).unwrap();
        assert_eq!(paired.channels(), vec![cs, dc]);
        assert_eq!(paired.error_norm(), ErrorNorm::Paired);
        assert_eq!(
            ChannelSelection::single(vec![cs]).unwrap().error_norm(),
            ErrorNorm::Individual
        );
    }

    #[test]
    fn interleaves_pairs_and_applies_weight_and_jacobian() {
        let mut reg = WeightRegistry::default();
        reg.register("size", WeightFunction::uniform(0.0, 4.0).unwrap())
            .unwrap();
        let transforms = vec![DomainTransform::for_domain(Domain::finite(0.0, 4.0)).unwrap()];
        let selection = ChannelSelection::paired(&[OutputKind::Extinction]).unwrap();
        let integrand = SpectrumIntegrand::new(
            &two_channel_model,
            &["size"],
            transforms,
            &reg,
            &selection,
            true,
        )
        .unwrap();

        assert_eq!(integrand.prepare().unwrap(), 4);
        // t = 0.5 -> size 2, density 1/4, jacobian 4.
        let out = integrand.evaluate(&[0.5]).unwrap();
        assert_eq!(out.len(), 4);
        assert_relative_eq!(out[0], 2.0); // cross-section @ 500
        assert_relative_eq!(out[1], -2.0); // dichroism @ 500
        assert_relative_eq!(out[2], 4.0); // cross-section @ 600
        assert_relative_eq!(out[3], 0.5); // dichroism @ 600
        assert_eq!(integrand.calls(), 2);
    }

    #[test]
    fn missing_channel_is_a_model_error() {
        let reg = WeightRegistry::default();
        let selection =
            ChannelSelection::single(vec![ChannelTag::new(Quantity::CrossSection, OutputKind::Scattering)])
                .unwrap();
        let integrand = SpectrumIntegrand::new(
            &two_channel_model,
            &["size"],
            vec![DomainTransform::for_domain(Domain::finite(0.0, 1.0)).unwrap()],
            &reg,
            &selection,
            false,
        )
        .unwrap();
        assert!(matches!(
            integrand.prepare(),
            Err(AveragingError::ModelEvaluation { call: 1, .. })
        ));
    }

    #[test]
    fn changing_wavelength_grid_is_fatal() {
        let model = |p: &[f64]| -> Result<SpectrumSample, ModelFailure> {
            let grid = if p[0] < 0.5 { array![1.0, 2.0] } else { array![1.0, 2.5] };
            Ok(SpectrumSample::new(grid).with_channel(
                ChannelTag::cross_section(OutputKind::Extinction),
                array![1.0, 1.0],
            ))
        };
        let reg = WeightRegistry::default();
        let selection =
            ChannelSelection::single(vec![ChannelTag::cross_section(OutputKind::Extinction)]).unwrap();
        let integrand = SpectrumIntegrand::new(
            &model,
            &["x"],
            vec![DomainTransform::for_domain(Domain::finite(0.0, 1.0)).unwrap()],
            &reg,
            &selection,
            false,
        )
        .unwrap();
        integrand.evaluate(&[0.1]).unwrap();
        assert!(matches!(
            integrand.evaluate(&[0.9]),
            Err(AveragingError::ModelEvaluation { call: 2, .. })
        ));
    }

    #[test]
    fn model_failure_carries_the_call_number() {
        let model = |_: &[f64]| -> Result<SpectrumSample, ModelFailure> { Err("solver diverged".into()) };
        let reg = WeightRegistry::default();
        let selection =
            ChannelSelection::single(vec![ChannelTag::cross_section(OutputKind::Extinction)]).unwrap();
        let integrand = SpectrumIntegrand::new(
            &model,
            &["x"],
            vec![DomainTransform::for_domain(Domain::Real).unwrap()],
            &reg,
            &selection,
            true,
        )
        .unwrap();
        match integrand.prepare() {
            Err(AveragingError::ModelEvaluation { call, reason }) => {
                assert_eq!(call, 1);
                assert!(reason.contains("solver diverged"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
