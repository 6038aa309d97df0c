//! h-adaptive cubature of vector-valued integrands over hyper-rectangles.
//!
//! Each region carries an estimate from an embedded rule pair: a higher and a
//! lower degree rule evaluated on shared points, whose difference is the local
//! error estimate.
//!
//! - One dimension: Gauss-Kronrod 7/15.
//! - Two or more: Genz-Malik degree 7 with the embedded degree 5 rule. The same
//!   points also give a fourth divided difference per axis, which picks the axis
//!   to bisect.
//!
//! Regions sit in a max-heap keyed on their worst group error, measured in
//! units of that group's tolerance at the first whole-box estimate. Every
//! round pops the worst region (or the `workers` worst), bisects it, evaluates
//! both halves and swaps the parent's contribution for the children's. The run
//! ends when the global estimate meets the tolerance under the chosen
//! [`ErrorNorm`], or when another round would exceed `max_evals`. The second
//! case returns the best estimate with `converged = false`.
//!
//! With a zero absolute tolerance the sequence of refinements never depends on
//! the relative tolerance, only on when the loop stops, so a tighter tolerance
//! cannot consume fewer evaluations.

use crate::error::AveragingError;
use crate::types::CubatureOptions;
use ndarray::Array1;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Dimensions beyond this make the 2^D Genz-Malik corner set impractical.
const MAX_DIM: usize = 20;

/// A vector-valued integrand.
///
/// Implemented for `Fn(&[f64]) -> Result<Array1<f64>, AveragingError>` closures.
pub trait VectorIntegrand: Sync {
    fn evaluate(&self, x: &[f64]) -> Result<Array1<f64>, AveragingError>;
}

impl<F> VectorIntegrand for F
where
    F: Fn(&[f64]) -> Result<Array1<f64>, AveragingError> + Sync,
{
    fn evaluate(&self, x: &[f64]) -> Result<Array1<f64>, AveragingError> {
        self(x)
    }
}

/// How per-component errors are combined before the stopping test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorNorm {
    /// Every component must meet the tolerance on its own.
    #[default]
    Individual,
    /// Adjacent components `(2k, 2k+1)` form one group, combined by the
    /// Euclidean norm. An odd trailing component stands alone.
    Paired,
    /// Consecutive groups of the given size, combined by the Euclidean norm.
    Grouped(usize),
    /// Sum over all components.
    L1,
    /// Euclidean norm over all components.
    L2,
    /// Maximum over all components.
    Linf,
}

impl ErrorNorm {
    pub fn validate(self) -> Result<(), AveragingError> {
        if self == ErrorNorm::Grouped(0) {
            return Err(AveragingError::InvalidConfig(
                "grouped error norm needs a group size of at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The norm that treats groups of `size` consecutive components as one.
    pub fn for_group_size(size: usize) -> Self {
        match size {
            1 => ErrorNorm::Individual,
            2 => ErrorNorm::Paired,
            k => ErrorNorm::Grouped(k),
        }
    }

    fn group_size(self) -> Option<usize> {
        match self {
            ErrorNorm::Individual => Some(1),
            ErrorNorm::Paired => Some(2),
            ErrorNorm::Grouped(k) => Some(k.max(1)),
            ErrorNorm::L1 | ErrorNorm::L2 | ErrorNorm::Linf => None,
        }
    }

    /// Collapses a vector of magnitudes into one value per group.
    pub fn combine(self, values: &[f64]) -> Vec<f64> {
        let euclid = |xs: &[f64]| xs.iter().fold(0.0f64, |acc, x| acc.hypot(*x));
        match self.group_size() {
            Some(1) => values.iter().map(|v| v.abs()).collect(),
            Some(k) => values.chunks(k).map(euclid).collect(),
            None => vec![match self {
                ErrorNorm::L1 => values.iter().map(|v| v.abs()).sum(),
                ErrorNorm::L2 => euclid(values),
                _ => values.iter().fold(0.0f64, |acc, v| acc.max(v.abs())),
            }],
        }
    }

    /// Whether `error` meets the tolerance relative to `value` in every group.
    pub fn converged(self, value: &[f64], error: &[f64], relative_tol: f64, absolute_tol: f64) -> bool {
        let vals = self.combine(value);
        let errs = self.combine(error);
        errs.iter()
            .zip(vals.iter())
            .all(|(&e, &v)| e <= absolute_tol || e <= relative_tol * v)
    }
}

/// Outcome of [`integrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubatureResult {
    pub integral: Array1<f64>,
    pub error: Array1<f64>,
    pub evaluations: usize,
    /// Number of sub-regions in the final partition.
    pub regions: usize,
    pub converged: bool,
}

struct Region {
    center: Vec<f64>,
    halfwidth: Vec<f64>,
    value: Array1<f64>,
    error: Array1<f64>,
    split_dim: usize,
    priority: f64,
}

/// Heap key of a region: its worst group error divided by that group's
/// tolerance scale.
///
/// The scale of group `g` is `max(|I_g|, absolute_tol / relative_tol)` with
/// `I_g` the whole-box estimate, or `absolute_tol` when `relative_tol` is zero.
/// Multiplying one channel by a constant leaves the ranking unchanged.
struct ErrorScale {
    norm: ErrorNorm,
    scales: Vec<f64>,
}

impl ErrorScale {
    fn new(norm: ErrorNorm, root_value: &[f64], relative_tol: f64, absolute_tol: f64) -> Self {
        let mut scales: Vec<f64> = norm
            .combine(root_value)
            .into_iter()
            .map(|v| {
                if relative_tol > 0.0 {
                    v.max(absolute_tol / relative_tol)
                } else {
                    absolute_tol
                }
            })
            .collect();
        // Groups with a vanishing or non-finite estimate borrow the widest scale.
        let usable = |s: f64| s > 0.0 && s.is_finite();
        let fallback = scales
            .iter()
            .copied()
            .filter(|&s| usable(s))
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
            .unwrap_or(1.0);
        for s in scales.iter_mut().filter(|s| !usable(**s)) {
            *s = fallback;
        }
        Self { norm, scales }
    }

    fn priority(&self, error: &Array1<f64>) -> f64 {
        let errs = self.norm.combine(&error.to_vec());
        // A NaN error must still be refined first.
        if errs.iter().any(|e| e.is_nan()) {
            return f64::INFINITY;
        }
        errs.iter()
            .zip(&self.scales)
            .fold(0.0f64, |acc, (e, s)| acc.max(e / s))
    }

    fn rank(&self, mut region: Region) -> Region {
        region.priority = self.priority(&region.error);
        region
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Region {}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

impl Region {
    /// Splits along `split_dim` into two geometric halves, not yet evaluated.
    fn bisect(&self) -> [(Vec<f64>, Vec<f64>); 2] {
        let d = self.split_dim;
        let mut halfwidth = self.halfwidth.clone();
        halfwidth[d] *= 0.5;
        let mut left = self.center.clone();
        let mut right = self.center.clone();
        left[d] -= halfwidth[d];
        right[d] += halfwidth[d];
        [(left, halfwidth.clone()), (right, halfwidth)]
    }
}

// Gauss-Kronrod 15-point abscissae (positive half, descending) and weights.
const XGK: [f64; 8] = [
    0.991_455_371_120_812_6,
    0.949_107_912_342_758_5,
    0.864_864_423_359_769_1,
    0.741_531_185_599_394_4,
    0.586_087_235_467_691_1,
    0.405_845_151_377_397_2,
    0.207_784_955_007_898_5,
    0.0,
];
const WGK: [f64; 8] = [
    0.022_935_322_010_529_22,
    0.063_092_092_629_978_55,
    0.104_790_010_322_250_2,
    0.140_653_259_715_525_9,
    0.169_004_726_639_267_9,
    0.190_350_578_064_785_4,
    0.204_432_940_075_298_9,
    0.209_482_141_084_727_8,
];
// Embedded 7-point Gauss weights, matching XGK[1], XGK[3], XGK[5], XGK[7].
const WG: [f64; 4] = [
    0.129_484_966_168_869_7,
    0.279_705_391_489_276_7,
    0.381_830_050_505_118_9,
    0.417_959_183_673_469_4,
];

/// Genz-Malik degree 7/5 rule for a fixed dimension.
#[derive(Debug, Clone, Copy)]
struct GenzMalik {
    dim: usize,
    w1: f64,
    w3: f64,
    w5: f64,
    e1: f64,
    e3: f64,
}

impl GenzMalik {
    const LAMBDA2: f64 = 0.358_568_582_800_318_1; // sqrt(9/70)
    const LAMBDA4: f64 = 0.948_683_298_050_513_8; // sqrt(9/10)
    const LAMBDA5: f64 = 0.688_247_201_611_685_3; // sqrt(9/19)
    const W2: f64 = 980.0 / 6561.0;
    const W4: f64 = 200.0 / 19683.0;
    const E2: f64 = 245.0 / 486.0;
    const E4: f64 = 25.0 / 729.0;
    // (LAMBDA2 / LAMBDA4)²
    const RATIO: f64 = 1.0 / 7.0;

    fn new(dim: usize) -> Self {
        let d = dim as f64;
        Self {
            dim,
            w1: (12824.0 - 9120.0 * d + 400.0 * d * d) / 19683.0,
            w3: (1820.0 - 400.0 * d) / 19683.0,
            w5: 6859.0 / 19683.0 / (1u64 << dim) as f64,
            e1: (729.0 - 950.0 * d + 50.0 * d * d) / 729.0,
            e3: (265.0 - 100.0 * d) / 1458.0,
        }
    }

    fn points(&self) -> usize {
        let d = self.dim;
        1 + 4 * d + 2 * d * (d - 1) + (1usize << d)
    }
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    GaussKronrod,
    GenzMalik(GenzMalik),
}

impl Rule {
    fn for_dim(dim: usize) -> Self {
        if dim == 1 {
            Rule::GaussKronrod
        } else {
            Rule::GenzMalik(GenzMalik::new(dim))
        }
    }

    fn points(&self) -> usize {
        match self {
            Rule::GaussKronrod => 15,
            Rule::GenzMalik(gm) => gm.points(),
        }
    }

    fn evaluate<F: VectorIntegrand + ?Sized>(
        &self,
        f: &F,
        center: Vec<f64>,
        halfwidth: Vec<f64>,
        output_dim: usize,
    ) -> Result<Region, AveragingError> {
        let (value, error, split_dim) = match self {
            Rule::GaussKronrod => gauss_kronrod(f, center[0], halfwidth[0], output_dim)?,
            Rule::GenzMalik(gm) => genz_malik(gm, f, &center, &halfwidth, output_dim)?,
        };
        Ok(Region {
            center,
            halfwidth,
            value,
            error,
            split_dim,
            // Set by `ErrorScale::rank` before the region enters the heap.
            priority: 0.0,
        })
    }
}

fn eval_point<F: VectorIntegrand + ?Sized>(
    f: &F,
    x: &[f64],
    output_dim: usize,
) -> Result<Array1<f64>, AveragingError> {
    let y = f.evaluate(x)?;
    if y.len() != output_dim {
        return Err(AveragingError::DimensionMismatch {
            expected: output_dim,
            found: y.len(),
        });
    }
    Ok(y)
}

fn gauss_kronrod<F: VectorIntegrand + ?Sized>(
    f: &F,
    center: f64,
    halfwidth: f64,
    output_dim: usize,
) -> Result<(Array1<f64>, Array1<f64>, usize), AveragingError> {
    let fc = eval_point(f, &[center], output_dim)?;
    let mut kronrod = &fc * WGK[7];
    let mut gauss = &fc * WG[3];
    for j in 0..7 {
        let dx = halfwidth * XGK[j];
        let pair = eval_point(f, &[center - dx], output_dim)? + eval_point(f, &[center + dx], output_dim)?;
        kronrod.scaled_add(WGK[j], &pair);
        if j % 2 == 1 {
            gauss.scaled_add(WG[j / 2], &pair);
        }
    }
    let error = (&kronrod - &gauss).mapv(|v| (v * halfwidth).abs());
    Ok((kronrod * halfwidth, error, 0))
}

fn genz_malik<F: VectorIntegrand + ?Sized>(
    gm: &GenzMalik,
    f: &F,
    center: &[f64],
    halfwidth: &[f64],
    output_dim: usize,
) -> Result<(Array1<f64>, Array1<f64>, usize), AveragingError> {
    let dim = gm.dim;
    let mut x = center.to_vec();

    let f0 = eval_point(f, &x, output_dim)?;
    let mut sum2 = Array1::<f64>::zeros(output_dim);
    let mut sum3 = Array1::<f64>::zeros(output_dim);
    let mut diffs = vec![0.0f64; dim];

    for i in 0..dim {
        let axis_pair = |lambda: f64, x: &mut Vec<f64>| -> Result<Array1<f64>, AveragingError> {
            x[i] = center[i] - lambda * halfwidth[i];
            let minus = eval_point(f, x, output_dim)?;
            x[i] = center[i] + lambda * halfwidth[i];
            let plus = eval_point(f, x, output_dim)?;
            x[i] = center[i];
            Ok(minus + plus)
        };
        let s2 = axis_pair(GenzMalik::LAMBDA2, &mut x)?;
        let s3 = axis_pair(GenzMalik::LAMBDA4, &mut x)?;
        diffs[i] = s2
            .iter()
            .zip(s3.iter())
            .zip(f0.iter())
            .map(|((&a, &b), &c)| ((a - 2.0 * c) - GenzMalik::RATIO * (b - 2.0 * c)).abs())
            .sum();
        sum2 += &s2;
        sum3 += &s3;
    }

    let mut sum4 = Array1::<f64>::zeros(output_dim);
    for i in 0..dim {
        for j in (i + 1)..dim {
            for (si, sj) in [(-1.0, -1.0), (-1.0, 1.0), (1.0, -1.0), (1.0, 1.0)] {
                x[i] = center[i] + si * GenzMalik::LAMBDA4 * halfwidth[i];
                x[j] = center[j] + sj * GenzMalik::LAMBDA4 * halfwidth[j];
                sum4 += &eval_point(f, &x, output_dim)?;
            }
            x[i] = center[i];
            x[j] = center[j];
        }
    }

    let mut sum5 = Array1::<f64>::zeros(output_dim);
    for corner in 0..(1usize << dim) {
        for k in 0..dim {
            let sign = if (corner >> k) & 1 == 1 { 1.0 } else { -1.0 };
            x[k] = center[k] + sign * GenzMalik::LAMBDA5 * halfwidth[k];
        }
        sum5 += &eval_point(f, &x, output_dim)?;
    }

    let volume: f64 = halfwidth.iter().map(|h| 2.0 * h).product();
    let degree7 = (&f0 * gm.w1
        + &sum2 * GenzMalik::W2
        + &sum3 * gm.w3
        + &sum4 * GenzMalik::W4
        + &sum5 * gm.w5)
        * volume;
    let degree5 = (&f0 * gm.e1 + &sum2 * GenzMalik::E2 + &sum3 * gm.e3 + &sum4 * GenzMalik::E4)
        * volume;
    let error = (&degree7 - &degree5).mapv(f64::abs);

    Ok((degree7, error, choose_split_dim(&diffs, halfwidth)))
}

/// Axis with the largest fourth difference; near-ties go to the widest axis.
fn choose_split_dim(diffs: &[f64], halfwidth: &[f64]) -> usize {
    let max_diff = diffs.iter().fold(0.0f64, |acc, d| acc.max(*d));
    let cutoff = max_diff * (1.0 - 1e-10);
    (0..diffs.len())
        .filter(|&i| diffs[i] >= cutoff)
        .max_by(|&a, &b| halfwidth[a].total_cmp(&halfwidth[b]).then(b.cmp(&a)))
        .unwrap_or(0)
}

fn validate_bounds(lower: &[f64], upper: &[f64]) -> Result<(), AveragingError> {
    if lower.is_empty() || lower.len() != upper.len() {
        return Err(AveragingError::InvalidDomain(format!(
            "lower and upper bounds must be non-empty and of equal length, got {} and {}",
            lower.len(),
            upper.len()
        )));
    }
    if lower.len() > MAX_DIM {
        return Err(AveragingError::InvalidConfig(format!(
            "cubature supports at most {MAX_DIM} dimensions, got {}",
            lower.len()
        )));
    }
    for (i, (&lo, &hi)) in lower.iter().zip(upper).enumerate() {
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(AveragingError::InvalidDomain(format!(
                "dimension {i}: bounds [{lo}, {hi}] are not a finite non-empty interval"
            )));
        }
    }
    Ok(())
}

/// Integrates `f` over the hyper-rectangle `[lower, upper]`.
///
/// `f` must return exactly `output_dim` values at every point. Running out of
/// budget is reported through [`CubatureResult::converged`]; errors from `f`
/// are returned unchanged.
pub fn integrate<F: VectorIntegrand + ?Sized>(
    f: &F,
    lower: &[f64],
    upper: &[f64],
    output_dim: usize,
    opts: &CubatureOptions,
) -> Result<CubatureResult, AveragingError> {
    validate_bounds(lower, upper)?;
    opts.validate()?;
    if output_dim == 0 {
        return Err(AveragingError::InvalidConfig(
            "output dimension must be at least 1".to_string(),
        ));
    }

    let dim = lower.len();
    let rule = Rule::for_dim(dim);
    let points = rule.points();
    if opts.max_evals < points {
        return Err(AveragingError::InvalidConfig(format!(
            "max_evals = {} is below the {points} evaluations of a single rule application in {dim}D",
            opts.max_evals
        )));
    }

    let pool = if opts.workers > 1 {
        Some(
            ThreadPoolBuilder::new()
                .num_threads(opts.workers)
                .build()
                .map_err(|e| {
                    AveragingError::InvalidConfig(format!("failed to build worker pool: {e}"))
                })?,
        )
    } else {
        None
    };

    let center: Vec<f64> = lower.iter().zip(upper).map(|(a, b)| 0.5 * (a + b)).collect();
    let halfwidth: Vec<f64> = lower.iter().zip(upper).map(|(a, b)| 0.5 * (b - a)).collect();
    let root = rule.evaluate(f, center, halfwidth, output_dim)?;
    let mut evaluations = points;
    let scale = ErrorScale::new(
        opts.error_norm,
        &root.value.to_vec(),
        opts.relative_tol,
        opts.absolute_tol,
    );
    let root = scale.rank(root);

    let mut total_value = root.value.clone();
    let mut total_error = root.error.clone();
    let mut heap = BinaryHeap::new();
    heap.push(root);

    let batch = opts.workers;
    let per_split = 2 * points;
    let mut converged = false;
    loop {
        if opts.error_norm.converged(
            &total_value.to_vec(),
            &total_error.to_vec(),
            opts.relative_tol,
            opts.absolute_tol,
        ) {
            converged = true;
            break;
        }
        let affordable = (opts.max_evals - evaluations) / per_split;
        let n_split = batch.min(affordable).min(heap.len());
        if n_split == 0 {
            break;
        }

        let mut pending = Vec::with_capacity(2 * n_split);
        for _ in 0..n_split {
            let Some(parent) = heap.pop() else { break };
            total_value -= &parent.value;
            total_error -= &parent.error;
            pending.extend(parent.bisect());
        }

        let children: Vec<Region> = match &pool {
            Some(pool) => pool.install(|| {
                pending
                    .into_par_iter()
                    .map(|(c, h)| rule.evaluate(f, c, h, output_dim))
                    .collect::<Result<Vec<_>, _>>()
            })?,
            None => pending
                .into_iter()
                .map(|(c, h)| rule.evaluate(f, c, h, output_dim))
                .collect::<Result<Vec<_>, _>>()?,
        };
        evaluations += children.len() * points;
        for child in children {
            total_value += &child.value;
            total_error += &child.error;
            heap.push(scale.rank(child));
        }
    }

    // Re-sum to shed the drift of the running totals.
    let mut integral = Array1::<f64>::zeros(output_dim);
    let mut error = Array1::<f64>::zeros(output_dim);
    for region in heap.iter() {
        integral += &region.value;
        error += &region.error;
    }

    if converged {
        log::debug!(
            "cubature converged in {dim}D: {evaluations} evaluations, {} regions",
            heap.len()
        );
    } else {
        log::warn!(
            "cubature stopped at max_evals = {} before reaching relative_tol = {:e} ({} regions)",
            opts.max_evals,
            opts.relative_tol,
            heap.len()
        );
    }

    Ok(CubatureResult {
        integral,
        error,
        evaluations,
        regions: heap.len(),
        converged,
    })
}
