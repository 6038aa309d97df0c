//! Variable transforms from physical parameter domains to canonical intervals.
//!
//! The cubature engine only ever sees bounded hyper-rectangles. Each parameter
//! dimension carries a [`DomainTransform`] that maps a canonical coordinate `t`
//! to the physical value `p` together with the Jacobian `dp/dt` that keeps the
//! integral unchanged:
//!
//! | domain        | kind           | canonical | `p(t)`            | `dp/dt`                 |
//! |---------------|----------------|-----------|-------------------|-------------------------|
//! | `[lo, hi]`    | `Linear`       | `[0, 1]`  | `lo + t (hi-lo)`  | `hi - lo`               |
//! | `[lo, ∞)`     | `SemiInfinite` | `[0, 1)`  | `lo + t/(1-t)`    | `1/(1-t)²`              |
//! | `(-∞, hi]`    | `SemiInfinite` | `(0, 1]`  | `hi - (1-t)/t`    | `1/t²`                  |
//! | `(-∞, ∞)`     | `FullLine`     | `(-1, 1)` | `t/(1-t²)`        | `(1+t²)/(1-t²)²`        |
//!
//! Unbounded kinds accept an optional length `scale` (and, on the full line, a
//! `center`) so that `t = ½` or `t = 0` lands on the bulk of a density instead
//! of at one unit from the bound; the plain forms above are `scale = 1`,
//! `center = 0`.
//!
//! Open canonical endpoints map to infinity. They are never evaluated: requests
//! at or beyond an open end are clamped to the nearest representable interior
//! point, which keeps `p` and the Jacobian finite.

use crate::error::AveragingError;
use serde::{Deserialize, Serialize};

/// Largest `f64` strictly below one.
const ONE_BELOW: f64 = 1.0 - f64::EPSILON / 2.0;
/// Mirror of [`ONE_BELOW`] for an open end at zero.
const ZERO_ABOVE: f64 = f64::EPSILON / 2.0;

/// Support of one physical parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Domain {
    /// Closed interval `[lo, hi]`.
    Finite { lo: f64, hi: f64 },
    /// Half line `[lo, ∞)`.
    LowerBounded { lo: f64 },
    /// Half line `(-∞, hi]`.
    UpperBounded { hi: f64 },
    /// Whole real line.
    Real,
}

impl Domain {
    pub fn finite(lo: f64, hi: f64) -> Self {
        Domain::Finite { lo, hi }
    }

    pub fn lower_bounded(lo: f64) -> Self {
        Domain::LowerBounded { lo }
    }

    pub fn upper_bounded(hi: f64) -> Self {
        Domain::UpperBounded { hi }
    }

    /// Checks the bounds are finite and ordered.
    pub fn validate(&self) -> Result<(), AveragingError> {
        match *self {
            Domain::Finite { lo, hi } => {
                if !(lo.is_finite() && hi.is_finite()) {
                    return Err(AveragingError::InvalidDomain(format!(
                        "finite domain requires finite bounds, got [{lo}, {hi}]"
                    )));
                }
                if lo >= hi {
                    return Err(AveragingError::InvalidDomain(format!(
                        "lower bound {lo} must be strictly less than upper bound {hi}"
                    )));
                }
                Ok(())
            }
            Domain::LowerBounded { lo } if !lo.is_finite() => Err(AveragingError::InvalidDomain(
                format!("half-line [lo, ∞) requires a finite lower bound, got {lo}"),
            )),
            Domain::UpperBounded { hi } if !hi.is_finite() => Err(AveragingError::InvalidDomain(
                format!("half-line (-∞, hi] requires a finite upper bound, got {hi}"),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, Domain::Finite { .. })
    }

    /// `(lo, hi)` with infinities for open sides.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Domain::Finite { lo, hi } => (lo, hi),
            Domain::LowerBounded { lo } => (lo, f64::INFINITY),
            Domain::UpperBounded { hi } => (f64::NEG_INFINITY, hi),
            Domain::Real => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn contains(&self, p: f64) -> bool {
        let (lo, hi) = self.bounds();
        p >= lo && p <= hi
    }

    /// Width of a finite domain; `None` when unbounded.
    pub fn width(&self) -> Option<f64> {
        match *self {
            Domain::Finite { lo, hi } => Some(hi - lo),
            _ => None,
        }
    }

    /// Intersection of two domains, `None` when it is empty or degenerate.
    pub fn intersect(&self, other: &Domain) -> Option<Domain> {
        let (a_lo, a_hi) = self.bounds();
        let (b_lo, b_hi) = other.bounds();
        let lo = a_lo.max(b_lo);
        let hi = a_hi.min(b_hi);
        if lo >= hi {
            return None;
        }
        Some(match (lo.is_finite(), hi.is_finite()) {
            (true, true) => Domain::Finite { lo, hi },
            (true, false) => Domain::LowerBounded { lo },
            (false, true) => Domain::UpperBounded { hi },
            (false, false) => Domain::Real,
        })
    }
}

/// Which change of variables a dimension uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    Linear,
    SemiInfinite,
    FullLine,
}

impl TransformKind {
    /// The only kind that matches a domain's shape.
    pub fn natural_for(domain: &Domain) -> Self {
        match domain {
            Domain::Finite { .. } => TransformKind::Linear,
            Domain::LowerBounded { .. } | Domain::UpperBounded { .. } => {
                TransformKind::SemiInfinite
            }
            Domain::Real => TransformKind::FullLine,
        }
    }
}

/// Bijection between a canonical coordinate and one physical parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainTransform {
    kind: TransformKind,
    domain: Domain,
    center: f64,
    scale: f64,
}

impl DomainTransform {
    /// Builds a transform of the requested kind, rejecting shape mismatches.
    pub fn new(kind: TransformKind, domain: Domain) -> Result<Self, AveragingError> {
        domain.validate()?;
        let expected = TransformKind::natural_for(&domain);
        if kind != expected {
            return Err(AveragingError::InvalidDomain(format!(
                "{kind:?} transform does not match domain {domain:?} (expected {expected:?})"
            )));
        }
        Ok(Self {
            kind,
            domain,
            center: 0.0,
            scale: 1.0,
        })
    }

    /// Sets the length scale of an unbounded map and, for the full line, its
    /// center. Linear transforms ignore both.
    pub fn with_scaling(mut self, center: f64, scale: f64) -> Result<Self, AveragingError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(AveragingError::InvalidDomain(format!(
                "transform scale must be positive and finite, got {scale}"
            )));
        }
        if !center.is_finite() {
            return Err(AveragingError::InvalidDomain(format!(
                "transform center must be finite, got {center}"
            )));
        }
        self.center = center;
        self.scale = scale;
        Ok(self)
    }

    pub fn for_domain(domain: Domain) -> Result<Self, AveragingError> {
        Self::new(TransformKind::natural_for(&domain), domain)
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Interval the engine integrates over for this dimension.
    pub fn canonical_bounds(&self) -> (f64, f64) {
        match self.kind {
            TransformKind::Linear | TransformKind::SemiInfinite => (0.0, 1.0),
            TransformKind::FullLine => (-1.0, 1.0),
        }
    }

    /// Clamps `t` into the evaluable part of the canonical interval.
    fn clamp(&self, t: f64) -> f64 {
        match (self.kind, self.domain) {
            (TransformKind::Linear, _) => t.clamp(0.0, 1.0),
            (TransformKind::SemiInfinite, Domain::UpperBounded { .. }) => t.clamp(ZERO_ABOVE, 1.0),
            (TransformKind::SemiInfinite, _) => t.clamp(0.0, ONE_BELOW),
            (TransformKind::FullLine, _) => t.clamp(-ONE_BELOW, ONE_BELOW),
        }
    }

    pub fn to_physical(&self, t: f64) -> f64 {
        let t = self.clamp(t);
        match self.domain {
            Domain::Finite { lo, hi } => lo + t * (hi - lo),
            Domain::LowerBounded { lo } => lo + self.scale * t / (1.0 - t),
            Domain::UpperBounded { hi } => hi - self.scale * (1.0 - t) / t,
            Domain::Real => self.center + self.scale * t / (1.0 - t * t),
        }
    }

    /// Inverse of [`to_physical`](Self::to_physical). Values outside the
    /// domain are clamped to its boundary first.
    pub fn to_canonical(&self, p: f64) -> f64 {
        match self.domain {
            Domain::Finite { lo, hi } => ((p - lo) / (hi - lo)).clamp(0.0, 1.0),
            Domain::LowerBounded { lo } => {
                let u = (p - lo).max(0.0) / self.scale;
                if u.is_infinite() { ONE_BELOW } else { u / (1.0 + u) }
            }
            Domain::UpperBounded { hi } => {
                let u = (hi - p).max(0.0) / self.scale;
                if u.is_infinite() { ZERO_ABOVE } else { 1.0 / (1.0 + u) }
            }
            Domain::Real => {
                let u = (p - self.center) / self.scale;
                if u == 0.0 {
                    0.0
                } else if u.is_infinite() {
                    ONE_BELOW.copysign(u)
                } else {
                    // Root of u t² + t - u = 0 inside (-1, 1), written to avoid cancellation.
                    2.0 * u / (1.0 + (1.0 + 4.0 * u * u).sqrt())
                }
            }
        }
    }

    /// `dp/dt` at canonical coordinate `t`; strictly positive.
    pub fn jacobian(&self, t: f64) -> f64 {
        let t = self.clamp(t);
        match self.domain {
            Domain::Finite { lo, hi } => hi - lo,
            Domain::LowerBounded { .. } => {
                let s = 1.0 - t;
                self.scale / (s * s)
            }
            Domain::UpperBounded { .. } => self.scale / (t * t),
            Domain::Real => {
                let s = 1.0 - t * t;
                self.scale * (1.0 + t * t) / (s * s)
            }
        }
    }
}
