//! Adaptive one-dimensional Gauss-Legendre quadrature.
//!
//! Scalar integrator used to validate weight functions (normalization and mass
//! captured inside finite bounds). It shares no code with the vector cubature
//! engine.
//!
//! # Implementation
//!
//! Nodes and weights of the `N_POINTS`-point Gauss-Legendre rule are computed
//! once with the Golub-Welsch algorithm: they are the eigenvalues and squared
//! first eigenvector components of the symmetric tridiagonal Jacobi matrix of
//! the Legendre recurrence. The rule is cached in a [`QuadratureContext`].
//!
//! Integration starts from a fixed number of equal panels and bisects any panel
//! whose rule value disagrees with the sum over its two halves by more than the
//! local share of the tolerance.

use std::sync::OnceLock;

/// Number of Gauss-Legendre nodes (exact for polynomials up to degree 19).
const N_POINTS: usize = 10;

/// Quadrature context that owns the Gauss-Legendre cache.
pub struct QuadratureContext {
    gl_cache: OnceLock<GaussLegendreRule>,
}

impl QuadratureContext {
    pub fn new() -> Self {
        Self {
            gl_cache: OnceLock::new(),
        }
    }

    fn gauss_legendre(&self) -> &GaussLegendreRule {
        self.gl_cache.get_or_init(compute_gauss_legendre)
    }
}

impl std::fmt::Debug for QuadratureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadratureContext")
            .field("gl_cached", &self.gl_cache.get().is_some())
            .finish()
    }
}

impl Default for QuadratureContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauss-Legendre rule on `[-1, 1]`.
struct GaussLegendreRule {
    /// Quadrature nodes (roots of Pₙ), ascending
    nodes: [f64; N_POINTS],
    /// Quadrature weights (sum to 2)
    weights: [f64; N_POINTS],
}

/// Compute Gauss-Legendre nodes and weights using the Golub-Welsch algorithm.
///
/// For Legendre polynomials with weight 1 on `[-1, 1]`:
/// - Recurrence: (k+1) Pₖ₊₁(x) = (2k+1) x Pₖ(x) - k Pₖ₋₁(x)
/// - Jacobi matrix has: diagonal = 0, off-diagonal[k-1] = k / sqrt(4k² - 1)
/// - μ₀ = ∫₋₁¹ 1 dx = 2
fn compute_gauss_legendre() -> GaussLegendreRule {
    let mut diag = [0.0f64; N_POINTS];
    let mut off_diag = [0.0f64; N_POINTS - 1];
    for (i, od) in off_diag.iter_mut().enumerate() {
        let k = (i + 1) as f64;
        *od = k / (4.0 * k * k - 1.0).sqrt();
    }

    let (eigenvalues, eigenvectors) = symmetric_tridiagonal_eigen(&mut diag, &mut off_diag);

    // `symmetric_tridiagonal_eigen` accumulates left rotations and returns Z = Q^T,
    // so q_{0i} is stored at eigenvectors[i][0].
    let mu0 = 2.0;
    let mut pairs: [(f64, f64); N_POINTS] = std::array::from_fn(|i| {
        let v0 = eigenvectors[i][0];
        (eigenvalues[i], mu0 * v0 * v0)
    });
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    GaussLegendreRule {
        nodes: std::array::from_fn(|i| pairs[i].0),
        weights: std::array::from_fn(|i| pairs[i].1),
    }
}

/// Symmetric tridiagonal eigenvalue decomposition using implicit QR with Wilkinson shifts.
///
/// Returns (eigenvalues, eigenvectors) where eigenvectors[i] is the i-th eigenvector.
fn symmetric_tridiagonal_eigen(
    diag: &mut [f64; N_POINTS],
    off_diag: &mut [f64; N_POINTS - 1],
) -> ([f64; N_POINTS], [[f64; N_POINTS]; N_POINTS]) {
    let mut z: [[f64; N_POINTS]; N_POINTS] = [[0.0; N_POINTS]; N_POINTS];
    for (i, row) in z.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    let eps = 1e-15;
    let max_iter = 100;

    // Work on successively smaller submatrices
    let mut n = N_POINTS;
    while n > 1 {
        let mut converged = false;
        for _ in 0..max_iter {
            // Find the largest unreduced block
            let mut m = n - 1;
            while m > 0 {
                if off_diag[m - 1].abs() <= eps * (diag[m - 1].abs() + diag[m].abs()) {
                    off_diag[m - 1] = 0.0;
                    break;
                }
                m -= 1;
            }

            if m == n - 1 {
                n -= 1;
                converged = true;
                break;
            }

            let shift = wilkinson_shift(diag[n - 2], diag[n - 1], off_diag[n - 2]);

            let mut x = diag[m] - shift;
            let mut y = off_diag[m];

            for k in m..(n - 1) {
                // Givens rotation to zero out y
                let (c, s) = if y.abs() > eps {
                    let r = x.hypot(y);
                    if r > 0.0 && r.is_finite() {
                        (x / r, -y / r)
                    } else {
                        (1.0, 0.0)
                    }
                } else {
                    (1.0, 0.0)
                };

                if k > m {
                    off_diag[k - 1] = x.hypot(y);
                }

                let d1 = diag[k];
                let d2 = diag[k + 1];
                let e_k = off_diag[k];

                diag[k] = c * c * d1 + s * s * d2 - 2.0 * c * s * e_k;
                diag[k + 1] = s * s * d1 + c * c * d2 + 2.0 * c * s * e_k;
                off_diag[k] = c * s * (d1 - d2) + (c * c - s * s) * e_k;

                if k < n - 2 {
                    x = off_diag[k];
                    y = -s * off_diag[k + 1];
                    off_diag[k + 1] *= c;
                }

                for i in 0..N_POINTS {
                    let t = z[k][i];
                    z[k][i] = c * t - s * z[k + 1][i];
                    z[k + 1][i] = s * t + c * z[k + 1][i];
                }
            }
        }
        if !converged {
            // Force trailing deflation so a stalled QR sweep cannot loop forever.
            off_diag[n - 2] = 0.0;
            n -= 1;
        }
    }

    (*diag, z)
}

#[inline]
fn wilkinson_shift(a: f64, c: f64, b: f64) -> f64 {
    let d = (a - c) * 0.5;
    let t = d.hypot(b);
    let sgn = if d >= 0.0 { 1.0 } else { -1.0 }; // sign(0)=+1
    let denom = d + sgn * t;

    if denom.abs() > f64::EPSILON * t.max(1.0) {
        c - (b * b) / denom
    } else {
        c - t
    }
}

/// Controls for [`integrate_1d`].
#[derive(Debug, Clone, Copy)]
pub struct Quad1dOptions {
    pub rel_tol: f64,
    pub abs_tol: f64,
    /// Maximum number of bisections applied to one initial panel.
    pub max_depth: usize,
    /// Number of equal panels the interval is cut into before adapting.
    pub initial_panels: usize,
}

impl Default for Quad1dOptions {
    fn default() -> Self {
        Self {
            rel_tol: 1e-10,
            abs_tol: 1e-13,
            max_depth: 40,
            initial_panels: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad1dResult {
    pub value: f64,
    pub error: f64,
    pub evaluations: usize,
}

fn apply_rule<F: FnMut(f64) -> f64>(rule: &GaussLegendreRule, f: &mut F, a: f64, b: f64) -> f64 {
    let mid = 0.5 * (a + b);
    let half = 0.5 * (b - a);
    rule.nodes
        .iter()
        .zip(rule.weights.iter())
        .map(|(&x, &w)| w * f(mid + half * x))
        .sum::<f64>()
        * half
}

/// Integrates `f` over the finite interval `[a, b]`.
///
/// Panels that hit `max_depth` are accepted as they stand and their
/// disagreement is still counted in `error`.
pub fn integrate_1d<F>(
    ctx: &QuadratureContext,
    mut f: F,
    a: f64,
    b: f64,
    opts: &Quad1dOptions,
) -> Quad1dResult
where
    F: FnMut(f64) -> f64,
{
    let rule = ctx.gauss_legendre();
    let total_width = b - a;
    if total_width == 0.0 {
        return Quad1dResult {
            value: 0.0,
            error: 0.0,
            evaluations: 0,
        };
    }

    let panels = opts.initial_panels.max(1);
    let mut evaluations = 0usize;
    let mut stack: Vec<(f64, f64, f64, usize)> = Vec::with_capacity(panels * 2);
    for i in 0..panels {
        let lo = a + total_width * i as f64 / panels as f64;
        let hi = a + total_width * (i + 1) as f64 / panels as f64;
        let whole = apply_rule(rule, &mut f, lo, hi);
        evaluations += N_POINTS;
        stack.push((lo, hi, whole, 0));
    }

    let mut value = 0.0;
    let mut error = 0.0;
    while let Some((lo, hi, whole, depth)) = stack.pop() {
        let mid = 0.5 * (lo + hi);
        let left = apply_rule(rule, &mut f, lo, mid);
        let right = apply_rule(rule, &mut f, mid, hi);
        evaluations += 2 * N_POINTS;

        let refined = left + right;
        let diff = (refined - whole).abs();
        let share = ((hi - lo) / total_width).abs();
        let allowed = (opts.abs_tol * share).max(opts.rel_tol * refined.abs());
        if diff <= allowed || depth + 1 >= opts.max_depth || !diff.is_finite() {
            value += refined;
            error += diff;
        } else {
            stack.push((lo, mid, left, depth + 1));
            stack.push((mid, hi, right, depth + 1));
        }
    }

    Quad1dResult {
        value,
        error,
        evaluations,
    }
}
