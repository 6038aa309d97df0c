/// Standard normal PDF φ(x).
#[inline]
pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Normal density with mean `mean` and standard deviation `sd`.
#[inline]
pub fn gaussian_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    normal_pdf((x - mean) / sd) / sd
}

/// Log-normal density on `(0, ∞)`; `mu` and `sigma` are the parameters of `ln x`.
#[inline]
pub fn log_normal_pdf(x: f64, mu: f64, sigma: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    normal_pdf((x.ln() - mu) / sigma) / (sigma * x)
}

/// Exponential density on `[0, ∞)`.
#[inline]
pub fn exponential_pdf(x: f64, rate: f64) -> f64 {
    if x < 0.0 { 0.0 } else { rate * (-rate * x).exp() }
}
