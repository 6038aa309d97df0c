//! Contract of the external spectrum model.
//!
//! The physical model (particle geometry, scattering solver) is opaque here.
//! It maps a parameter vector to a [`SpectrumSample`]: one shared wavelength
//! grid and a list of tagged channels with one value per wavelength.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Physical quantity carried by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    CrossSection,
    Dichroism,
}

/// Optical process a channel refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputKind {
    Extinction,
    Absorption,
    Scattering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTag {
    pub quantity: Quantity,
    pub kind: OutputKind,
}

impl ChannelTag {
    pub const fn new(quantity: Quantity, kind: OutputKind) -> Self {
        Self { quantity, kind }
    }

    pub const fn cross_section(kind: OutputKind) -> Self {
        Self::new(Quantity::CrossSection, kind)
    }

    pub const fn dichroism(kind: OutputKind) -> Self {
        Self::new(Quantity::Dichroism, kind)
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = match self.quantity {
            Quantity::CrossSection => "cross_section",
            Quantity::Dichroism => "dichroism",
        };
        let k = match self.kind {
            OutputKind::Extinction => "ext",
            OutputKind::Absorption => "abs",
            OutputKind::Scattering => "sca",
        };
        write!(f, "{q}:{k}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub tag: ChannelTag,
    pub values: Array1<f64>,
}

/// Model output for one parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSample {
    pub wavelengths: Array1<f64>,
    pub channels: Vec<Channel>,
}

impl SpectrumSample {
    pub fn new(wavelengths: Array1<f64>) -> Self {
        Self {
            wavelengths,
            channels: Vec::new(),
        }
    }

    /// Builder-style channel append.
    pub fn with_channel(mut self, tag: ChannelTag, values: Array1<f64>) -> Self {
        self.channels.push(Channel { tag, values });
        self
    }

    pub fn channel(&self, tag: ChannelTag) -> Option<&Array1<f64>> {
        self.channels
            .iter()
            .find(|c| c.tag == tag)
            .map(|c| &c.values)
    }

    pub fn tags(&self) -> Vec<ChannelTag> {
        self.channels.iter().map(|c| c.tag).collect()
    }
}

/// Failure reported by the external model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFailure(pub String);

impl fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ModelFailure {}

impl From<String> for ModelFailure {
    fn from(s: String) -> Self {
        ModelFailure(s)
    }
}

impl From<&str> for ModelFailure {
    fn from(s: &str) -> Self {
        ModelFailure(s.to_string())
    }
}

/// A deterministic, side-effect-free spectrum model.
///
/// Implemented for any `Fn(&[f64]) -> Result<SpectrumSample, ModelFailure>`
/// that is `Sync`, so plain closures can be passed directly.
pub trait SpectrumModel: Sync {
    fn evaluate(&self, params: &[f64]) -> Result<SpectrumSample, ModelFailure>;
}

impl<F> SpectrumModel for F
where
    F: Fn(&[f64]) -> Result<SpectrumSample, ModelFailure> + Sync,
{
    fn evaluate(&self, params: &[f64]) -> Result<SpectrumSample, ModelFailure> {
        self(params)
    }
}

/// Memoizes samples keyed by the parameter vector rounded to `decimals`.
///
/// Useful when several averaging runs (for example a tolerance sweep) revisit
/// the same parameter points with an expensive model.
pub struct CachedModel<M> {
    inner: M,
    decimals: i32,
    cache: Mutex<HashMap<Vec<u64>, SpectrumSample>>,
    hits: AtomicUsize,
}

impl<M: SpectrumModel> CachedModel<M> {
    pub fn new(inner: M, decimals: i32) -> Self {
        Self {
            inner,
            decimals,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
        }
    }

    /// Bit patterns of the rounded parameters, or `None` when a parameter has
    /// no finite rounded value and the point must bypass the cache.
    fn key(&self, params: &[f64]) -> Option<Vec<u64>> {
        let factor = 10f64.powi(self.decimals);
        params
            .iter()
            .map(|p| {
                let scaled = (p * factor).round();
                // -0.0 and 0.0 share a key.
                scaled.is_finite().then(|| (scaled + 0.0).to_bits())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

impl<M: SpectrumModel> SpectrumModel for CachedModel<M> {
    fn evaluate(&self, params: &[f64]) -> Result<SpectrumSample, ModelFailure> {
        let Some(key) = self.key(params) else {
            return self.inner.evaluate(params);
        };
        let poisoned = |_| ModelFailure::from("sample cache lock poisoned");
        if let Some(hit) = self.cache.lock().map_err(poisoned)?.get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        let sample = self.inner.evaluate(params)?;
        self.cache
            .lock()
            .map_err(poisoned)?
            .insert(key, sample.clone());
        Ok(sample)
    }
}
