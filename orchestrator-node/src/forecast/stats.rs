//! Statistical primitives for the forecaster: least squares, autocorrelation,
//! stationarity and residual-independence tests, and the distribution
//! quantiles they need.

use ndarray::{Array1, Array2};

/// 5% critical value of the ADF t-statistic (constant, no trend)
const ADF_CRITICAL_5PCT: f64 = -2.86;

/// Ordinary least squares fit
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coefficients: Array1<f64>,
    pub residuals: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub sigma2: f64,
}

/// Solve y = X beta by normal equations. Returns `None` when X'X is singular.
pub fn ols(x: &Array2<f64>, y: &Array1<f64>) -> Option<OlsFit> {
    let n = y.len();
    let k = x.ncols();
    if n < k || n != x.nrows() || k == 0 {
        return None;
    }
    let xtx = x.t().dot(x);
    let xty = x.t().dot(y);
    let xtx_inv = invert(&xtx)?;
    let coefficients = xtx_inv.dot(&xty);
    let fitted = x.dot(&coefficients);
    let residuals = y - &fitted;
    let dof = n.saturating_sub(k).max(1);
    let sigma2 = residuals.dot(&residuals) / dof as f64;
    let std_errors = Array1::from_iter(
        (0..k).map(|i| (xtx_inv[[i, i]] * sigma2).max(0.0).sqrt()),
    );
    Some(OlsFit {
        coefficients,
        residuals,
        std_errors,
        sigma2,
    })
}

/// Gauss-Jordan inversion with partial pivoting
pub fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return None;
    }
    let mut work = a.clone();
    let mut inv = Array2::<f64>::eye(n);

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_mag = work[[col, col]].abs();
        for row in (col + 1)..n {
            let mag = work[[row, col]].abs();
            if mag > pivot_mag {
                pivot_mag = mag;
                pivot_row = row;
            }
        }
        if pivot_mag < 1e-12 {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                work.swap([col, j], [pivot_row, j]);
                inv.swap([col, j], [pivot_row, j]);
            }
        }
        let pivot = work[[col, col]];
        for j in 0..n {
            work[[col, j]] /= pivot;
            inv[[col, j]] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                work[[row, j]] -= factor * work[[col, j]];
                inv[[row, j]] -= factor * inv[[col, j]];
            }
        }
    }
    Some(inv)
}

/// Sample autocorrelation at lags 1..=max_lag
pub fn acf(series: &[f64], max_lag: usize) -> Vec<f64> {
    let n = series.len();
    if n < 2 {
        return Vec::new();
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let denom: f64 = series.iter().map(|v| (v - mean).powi(2)).sum();
    if denom < 1e-12 {
        return vec![0.0; max_lag];
    }
    (1..=max_lag.min(n - 1))
        .map(|lag| {
            let num: f64 = (lag..n)
                .map(|t| (series[t] - mean) * (series[t - lag] - mean))
                .sum();
            num / denom
        })
        .collect()
}

/// Augmented Dickey-Fuller t-statistic with one lagged difference term.
/// Returns `None` when the series is too short or the regression degenerates.
pub fn adf_statistic(series: &[f64]) -> Option<f64> {
    let n = series.len();
    if n < 8 {
        return None;
    }
    let lags = 1usize;
    let rows = n - lags - 1;
    let mut x = Array2::<f64>::zeros((rows, 2 + lags));
    let mut y = Array1::<f64>::zeros(rows);
    for (row, t) in ((lags + 1)..n).enumerate() {
        y[row] = series[t] - series[t - 1];
        x[[row, 0]] = 1.0;
        x[[row, 1]] = series[t - 1];
        for j in 1..=lags {
            x[[row, 1 + j]] = series[t - j] - series[t - j - 1];
        }
    }
    let fit = ols(&x, &y)?;
    let se = fit.std_errors[1];
    if se <= 1e-12 {
        return None;
    }
    Some(fit.coefficients[1] / se)
}

/// ADF acceptance of stationarity at the 5% level
pub fn is_stationary(series: &[f64]) -> bool {
    adf_statistic(series)
        .map(|t| t < ADF_CRITICAL_5PCT)
        .unwrap_or(false)
}

/// Ljung-Box residual-independence test at the 5% level.
/// `fitted_params` is the number of estimated ARMA coefficients.
pub fn ljung_box_passes(residuals: &[f64], fitted_params: usize) -> bool {
    let n = residuals.len();
    if n < 8 {
        return false;
    }
    let lags = (n / 4).clamp(2, 10);
    let r = acf(residuals, lags);
    let q: f64 = r
        .iter()
        .enumerate()
        .map(|(i, rho)| rho * rho / (n - (i + 1)) as f64)
        .sum::<f64>()
        * n as f64
        * (n + 2) as f64;
    let dof = lags.saturating_sub(fitted_params).max(1);
    q <= chi2_quantile(0.95, dof)
}

/// Chi-square quantile via the Wilson-Hilferty approximation
pub fn chi2_quantile(p: f64, dof: usize) -> f64 {
    let k = dof as f64;
    let z = normal_quantile(p);
    let term = 1.0 - 2.0 / (9.0 * k) + z * (2.0 / (9.0 * k)).sqrt();
    k * term.powi(3)
}

/// Standard normal quantile (Abramowitz & Stegun 26.2.23)
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let (tail, sign) = if p < 0.5 { (p, -1.0) } else { (1.0 - p, 1.0) };
    let t = (-2.0 * tail.ln()).sqrt();
    let numerator = 2.515517 + 0.802853 * t + 0.010328 * t * t;
    let denominator = 1.0 + 1.432788 * t + 0.189269 * t * t + 0.001308 * t * t * t;
    sign * (t - numerator / denominator)
}

/// Standard normal CDF via erf approximation (Abramowitz & Stegun 7.1.26)
pub fn normal_cdf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    0.5 * (1.0 + sign * erf)
}

/// First difference
pub fn difference(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Seasonal difference at the given period
pub fn seasonal_difference(series: &[f64], period: usize) -> Vec<f64> {
    if series.len() <= period {
        return Vec::new();
    }
    (period..series.len())
        .map(|t| series[t] - series[t - period])
        .collect()
}

/// Polynomial product over the lag operator; index = lag, value = coefficient
pub fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_ols_recovers_line() {
        // y = 2 + 3x
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0], [1.0, 4.0]];
        let y = array![2.0, 5.0, 8.0, 11.0, 14.0];
        let fit = ols(&x, &y).unwrap();
        assert!((fit.coefficients[0] - 2.0).abs() < 1e-9);
        assert!((fit.coefficients[1] - 3.0).abs() < 1e-9);
        assert!(fit.sigma2 < 1e-12);
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let y = array![1.0, 2.0, 3.0];
        assert!(ols(&x, &y).is_none());
    }

    #[test]
    fn test_invert_round_trip() {
        let a = array![[4.0, 1.0], [2.0, 3.0]];
        let inv = invert(&a).unwrap();
        let identity = a.dot(&inv);
        assert!((identity[[0, 0]] - 1.0).abs() < 1e-9);
        assert!(identity[[0, 1]].abs() < 1e-9);
    }

    #[test]
    fn test_acf_of_alternating_series() {
        let series: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let r = acf(&series, 4);
        assert!(r[0] < -0.9);
        assert!(r[1] > 0.9);
    }

    #[test]
    fn test_random_walk_not_stationary() {
        // Deterministic pseudo-random increments
        let mut value = 0.0;
        let mut series = Vec::new();
        let mut state = 88172645463325252u64;
        for _ in 0..60 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let step = (state % 1000) as f64 / 500.0 - 1.0;
            value += step + 0.5;
            series.push(value);
        }
        assert!(!is_stationary(&series));
        assert!(is_stationary(&difference(&series)));
    }

    #[test]
    fn test_normal_quantile_symmetry() {
        let z = normal_quantile(0.975);
        assert!((z - 1.96).abs() < 0.01);
        assert!((normal_quantile(0.025) + z).abs() < 0.01);
        assert!((normal_cdf(z) - 0.975).abs() < 0.002);
    }

    #[test]
    fn test_ljung_box_on_white_noise() {
        let mut state = 0x2545F4914F6CDD1Du64;
        let mut noise = Vec::new();
        for _ in 0..40 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            noise.push((state % 10_000) as f64 / 10_000.0 - 0.5);
        }
        assert!(ljung_box_passes(&noise, 0));
    }

    #[test]
    fn test_poly_mul() {
        // (1 - 0.5B)(1 - B) = 1 - 1.5B + 0.5B^2
        let product = poly_mul(&[1.0, -0.5], &[1.0, -1.0]);
        assert_eq!(product, vec![1.0, -1.5, 0.5]);
    }
}
