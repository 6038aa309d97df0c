#![deny(dead_code)]
#![deny(unused_imports)]

pub mod average;
pub mod cubature;
pub mod error;
pub mod integrand;
pub mod model;
pub mod probability;
pub mod quadrature;
pub mod transform;
pub mod types;
pub mod weights;

pub use average::{
    AveragedSpectrum, Averager, GridWeighting, NaiveAverage, ParameterMass, ParameterMeaning,
    ParameterSpec,
};
pub use cubature::{CubatureResult, ErrorNorm, VectorIntegrand, integrate};
pub use error::AveragingError;
pub use integrand::{ChannelSelection, SpectrumIntegrand};
pub use model::{
    CachedModel, Channel, ChannelTag, ModelFailure, OutputKind, Quantity, SpectrumModel,
    SpectrumSample,
};
pub use quadrature::{Quad1dOptions, Quad1dResult, QuadratureContext, integrate_1d};
pub use transform::{Domain, DomainTransform, TransformKind};
pub use types::{AveragingConfig, CubatureOptions, Normalization};
pub use weights::{NormalizationReport, WeightFunction, WeightRegistry};
