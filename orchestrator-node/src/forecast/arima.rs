//! Simplified seasonal ARIMA fitted by linearized least squares.
//!
//! The recurrence is additive in the seasonal terms:
//!   w_t = c + Σ φ_i w_{t-i} + Σ Φ_i w_{t-s·i} + e_t + Σ θ_i e_{t-i} + Σ Θ_i e_{t-s·i}
//! over the regularly and seasonally differenced series w. Coefficients come
//! from a two-stage Hannan-Rissanen regression; order selection minimizes AIC
//! among fits whose residuals pass a Ljung-Box independence test.

use ndarray::{Array1, Array2};

use super::stats;
use crate::error::{OrchestratorError, Result};

/// Order of a fitted model: (p, d, q) regular, (P, D, Q)_s seasonal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SarimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
    pub sp: usize,
    pub sd: usize,
    pub sq: usize,
    pub season: usize,
}

impl SarimaOrder {
    /// Tie-break key for AIC selection
    pub fn complexity(&self) -> usize {
        self.p + self.q + self.sp + self.sq
    }
}

/// Fit search space
#[derive(Debug, Clone, Copy)]
pub struct FitConfig {
    pub p_max: usize,
    pub q_max: usize,
    pub d_max: usize,
    pub sp_max: usize,
    pub sq_max: usize,
    /// AIC difference treated as a tie
    pub aic_epsilon: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            p_max: 3,
            q_max: 3,
            d_max: 2,
            sp_max: 1,
            sq_max: 1,
            aic_epsilon: 0.5,
        }
    }
}

/// Forecast with confidence bounds, one entry per horizon step
#[derive(Debug, Clone)]
pub struct Forecast {
    pub values: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub confidence_level: f64,
}

impl Forecast {
    /// Probability that the true value at `step` exceeds `threshold`,
    /// assuming Gaussian forecast errors with the band's implied sigma
    pub fn exceedance_probability(&self, step: usize, threshold: f64) -> f64 {
        let Some(&point) = self.values.get(step) else {
            return 0.0;
        };
        let half_width = (self.upper[step] - self.lower[step]) / 2.0;
        let z = stats::normal_quantile((1.0 + self.confidence_level) / 2.0);
        let sigma = if z > 0.0 { half_width / z } else { 0.0 };
        if sigma <= 1e-12 {
            return if point > threshold { 1.0 } else { 0.0 };
        }
        1.0 - stats::normal_cdf((threshold - point) / sigma)
    }
}

/// A fitted model: coefficients only. Forecasts re-anchor on the series
/// passed to [`FittedModel::forecast`], so a model fitted a few samples ago
/// still forecasts from current observations.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub order: SarimaOrder,
    pub intercept: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub sar: Vec<f64>,
    pub sma: Vec<f64>,
    pub sigma2: f64,
    pub aic: f64,
}

/// Automatic order selection and fit
pub fn fit_auto(series: &[f64], config: &FitConfig) -> Result<FittedModel> {
    let n = series.len();
    if n < 8 {
        return Err(OrchestratorError::ForecastUnavailable(format!(
            "insufficient data ({n} samples)"
        )));
    }

    // A constant series forecasts itself exactly
    if is_constant(series) {
        return Ok(FittedModel {
            order: SarimaOrder {
                p: 0,
                d: 0,
                q: 0,
                sp: 0,
                sd: 0,
                sq: 0,
                season: 0,
            },
            intercept: series[0],
            ar: Vec::new(),
            ma: Vec::new(),
            sar: Vec::new(),
            sma: Vec::new(),
            sigma2: 0.0,
            aic: f64::MIN,
        });
    }

    // Difference until the ADF test accepts stationarity
    let mut current = series.to_vec();
    let mut d = 0usize;
    while d < config.d_max && !stats::is_stationary(&current) {
        current = stats::difference(&current);
        d += 1;
    }
    if !stats::is_stationary(&current) {
        return Err(OrchestratorError::ForecastUnavailable(format!(
            "series not stationary after {d} differences"
        )));
    }

    // Seasonal period from the autocorrelation of the differenced series
    let season = detect_season(&current);
    let (sd, seasonal) = if season > 0 { (1, true) } else { (0, false) };

    let mut best: Option<FittedModel> = None;
    for p in 0..=config.p_max {
        for q in 0..=config.q_max {
            let seasonal_orders: Vec<(usize, usize)> = if seasonal {
                (0..=config.sp_max)
                    .flat_map(|sp| (0..=config.sq_max).map(move |sq| (sp, sq)))
                    .collect()
            } else {
                vec![(0, 0)]
            };
            for (sp, sq) in seasonal_orders {
                let order = SarimaOrder {
                    p,
                    d,
                    q,
                    sp,
                    sd,
                    sq,
                    season,
                };
                let Some(candidate) = fit(series, order) else {
                    continue;
                };
                best = Some(match best.take() {
                    None => candidate,
                    Some(incumbent) => pick(incumbent, candidate, config.aic_epsilon),
                });
            }
        }
    }

    best.ok_or_else(|| {
        OrchestratorError::ForecastUnavailable("no order passed residual diagnostics".into())
    })
}

fn pick(incumbent: FittedModel, candidate: FittedModel, epsilon: f64) -> FittedModel {
    if candidate.aic < incumbent.aic - epsilon {
        return candidate;
    }
    if (candidate.aic - incumbent.aic).abs() <= epsilon
        && candidate.order.complexity() < incumbent.order.complexity()
    {
        return candidate;
    }
    incumbent
}

fn is_constant(series: &[f64]) -> bool {
    let (min, max) = series
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    (max - min).abs() < 1e-9
}

/// Seasonal period in [2, n/2] with a significant autocorrelation peak
fn detect_season(series: &[f64]) -> usize {
    let n = series.len();
    if n < 8 {
        return 0;
    }
    let max_lag = n / 2;
    let r = stats::acf(series, max_lag);
    let significance = 1.96 / (n as f64).sqrt();
    let mut best_lag = 0usize;
    let mut best_value = significance;
    for (i, &value) in r.iter().enumerate() {
        let lag = i + 1;
        if lag < 2 {
            continue;
        }
        if value > best_value {
            best_value = value;
            best_lag = lag;
        }
    }
    // Seasonal terms need at least two full periods after differencing
    if best_lag > 0 && n >= 2 * best_lag + 4 {
        best_lag
    } else {
        0
    }
}

/// Apply the order's differencing, regular first, then seasonal
fn apply_differencing(series: &[f64], order: SarimaOrder) -> Vec<Vec<f64>> {
    let mut levels = vec![series.to_vec()];
    for _ in 0..order.d {
        let next = stats::difference(levels.last().unwrap());
        levels.push(next);
    }
    for _ in 0..order.sd {
        let next = stats::seasonal_difference(levels.last().unwrap(), order.season);
        levels.push(next);
    }
    levels
}

/// Hannan-Rissanen fit for one candidate order; `None` when the candidate is
/// infeasible or its residuals fail the independence test
fn fit(series: &[f64], order: SarimaOrder) -> Option<FittedModel> {
    let levels = apply_differencing(series, order);
    let w = levels.last().unwrap().clone();
    let n = w.len();
    let s = order.season;

    let max_ar_lag = order.p.max(order.sp * s);
    let max_ma_lag = order.q.max(order.sq * s);
    let has_ma = order.q + order.sq > 0;

    // Stage 1: long autoregression to estimate innovations
    let long_ar = if has_ma { (n / 3).clamp(2, 10) } else { 0 };
    let t0 = max_ar_lag.max(max_ma_lag).max(long_ar);
    let k = 1 + order.complexity();
    if n < 8 || n <= t0 + k + 2 {
        return None;
    }

    let ehat: Vec<f64> = if has_ma {
        let rows = n - long_ar;
        let mut x = Array2::<f64>::zeros((rows, 1 + long_ar));
        let mut y = Array1::<f64>::zeros(rows);
        for (row, t) in (long_ar..n).enumerate() {
            y[row] = w[t];
            x[[row, 0]] = 1.0;
            for i in 1..=long_ar {
                x[[row, i]] = w[t - i];
            }
        }
        let stage1 = stats::ols(&x, &y)?;
        let mut e = vec![0.0; n];
        for (row, t) in (long_ar..n).enumerate() {
            e[t] = stage1.residuals[row];
        }
        e
    } else {
        vec![0.0; n]
    };

    // Stage 2: regression on AR, seasonal AR, MA and seasonal MA terms
    let (intercept, ar, sar, ma, sma) = if order.complexity() == 0 {
        let mean = w.iter().sum::<f64>() / n as f64;
        (mean, Vec::new(), Vec::new(), Vec::new(), Vec::new())
    } else {
        let rows = n - t0;
        let mut x = Array2::<f64>::zeros((rows, k));
        let mut y = Array1::<f64>::zeros(rows);
        for (row, t) in (t0..n).enumerate() {
            y[row] = w[t];
            let mut col = 0;
            x[[row, col]] = 1.0;
            col += 1;
            for i in 1..=order.p {
                x[[row, col]] = w[t - i];
                col += 1;
            }
            for i in 1..=order.sp {
                x[[row, col]] = w[t - s * i];
                col += 1;
            }
            for i in 1..=order.q {
                x[[row, col]] = ehat[t - i];
                col += 1;
            }
            for i in 1..=order.sq {
                x[[row, col]] = ehat[t - s * i];
                col += 1;
            }
        }
        let stage2 = stats::ols(&x, &y)?;
        let beta = stage2.coefficients;
        if beta.iter().any(|c| !c.is_finite() || c.abs() > 10.0) {
            return None;
        }
        let mut idx = 1;
        let take = |idx: &mut usize, count: usize| -> Vec<f64> {
            let slice: Vec<f64> = (0..count).map(|i| beta[*idx + i]).collect();
            *idx += count;
            slice
        };
        let ar = take(&mut idx, order.p);
        let sar = take(&mut idx, order.sp);
        let ma = take(&mut idx, order.q);
        let sma = take(&mut idx, order.sq);
        (beta[0], ar, sar, ma, sma)
    };

    let model = FittedModel {
        order,
        intercept,
        ar,
        ma,
        sar,
        sma,
        sigma2: 0.0,
        aic: 0.0,
    };

    // Conditional residuals from the full recursion
    let residuals = model.residuals_on(&w, t0);
    let effective = &residuals[t0..];
    let n_eff = effective.len();
    if n_eff < 4 {
        return None;
    }
    let sigma2 = effective.iter().map(|e| e * e).sum::<f64>() / n_eff as f64;
    let aic = n_eff as f64 * sigma2.max(1e-12).ln() + 2.0 * k as f64;

    if !stats::ljung_box_passes(effective, order.complexity()) {
        return None;
    }

    Some(FittedModel {
        sigma2,
        aic,
        ..model
    })
}

impl FittedModel {
    /// One-step conditional residuals over a differenced series
    fn residuals_on(&self, w: &[f64], t0: usize) -> Vec<f64> {
        let s = self.order.season;
        let mut e = vec![0.0; w.len()];
        for t in t0..w.len() {
            let mut pred = self.intercept;
            for (i, phi) in self.ar.iter().enumerate() {
                pred += phi * w[t - (i + 1)];
            }
            for (i, phi) in self.sar.iter().enumerate() {
                pred += phi * w[t - s * (i + 1)];
            }
            for (i, theta) in self.ma.iter().enumerate() {
                let lag = i + 1;
                if t >= lag {
                    pred += theta * e[t - lag];
                }
            }
            for (i, theta) in self.sma.iter().enumerate() {
                let lag = s * (i + 1);
                if t >= lag {
                    pred += theta * e[t - lag];
                }
            }
            e[t] = w[t] - pred;
        }
        e
    }

    fn startup_lag(&self) -> usize {
        let s = self.order.season;
        self.order
            .p
            .max(self.order.sp * s)
            .max(self.order.q)
            .max(self.order.sq * s)
    }

    /// h-step forecast anchored on the given series
    pub fn forecast(&self, series: &[f64], horizon: usize, confidence_level: f64) -> Result<Forecast> {
        let mut levels = apply_differencing(series, self.order);
        let w = levels.last().unwrap().clone();
        let needed = self.startup_lag() + 2;
        if w.len() < needed {
            return Err(OrchestratorError::ForecastUnavailable(format!(
                "series too short to anchor forecast ({} < {needed})",
                w.len()
            )));
        }

        let t0 = self.startup_lag();
        let residuals = self.residuals_on(&w, t0);
        let s = self.order.season;

        // Extend the differenced series; future innovations are zero
        let mut w_ext = w.clone();
        let mut e_ext = residuals;
        for _ in 0..horizon {
            let t = w_ext.len();
            let mut pred = self.intercept;
            for (i, phi) in self.ar.iter().enumerate() {
                pred += phi * w_ext[t - (i + 1)];
            }
            for (i, phi) in self.sar.iter().enumerate() {
                pred += phi * w_ext[t - s * (i + 1)];
            }
            for (i, theta) in self.ma.iter().enumerate() {
                let lag = i + 1;
                if t >= lag {
                    pred += theta * e_ext[t - lag];
                }
            }
            for (i, theta) in self.sma.iter().enumerate() {
                let lag = s * (i + 1);
                if t >= lag {
                    pred += theta * e_ext[t - lag];
                }
            }
            w_ext.push(pred);
            e_ext.push(0.0);
        }

        // Undo the differencing chain, deepest level first
        let forecast_w: Vec<f64> = w_ext[w.len()..].to_vec();
        let depth = levels.len();
        let mut child_forecasts = forecast_w;
        for level_idx in (0..depth - 1).rev() {
            // Level `level_idx + 1` was produced from `level_idx`; the last
            // `sd` levels are seasonal, the ones before them regular.
            let seasonal_level = level_idx + 1 > self.order.d;
            let parent = &mut levels[level_idx];
            let mut parent_forecasts = Vec::with_capacity(child_forecasts.len());
            for &diff_value in &child_forecasts {
                let next = if seasonal_level {
                    let back = parent.len() - s;
                    parent[back] + diff_value
                } else {
                    parent[parent.len() - 1] + diff_value
                };
                parent.push(next);
                parent_forecasts.push(next);
            }
            child_forecasts = parent_forecasts;
        }
        let values = child_forecasts;

        // Step-ahead error propagation through psi weights of the combined
        // AR-and-differencing polynomial
        let psi = self.psi_weights(horizon);
        let z = stats::normal_quantile((1.0 + confidence_level) / 2.0);
        let mut lower = Vec::with_capacity(horizon);
        let mut upper = Vec::with_capacity(horizon);
        let mut cumulative = 0.0;
        for (k, value) in values.iter().enumerate() {
            cumulative += psi[k] * psi[k];
            let sd = (self.sigma2 * cumulative).max(0.0).sqrt();
            lower.push(value - z * sd);
            upper.push(value + z * sd);
        }

        Ok(Forecast {
            values,
            lower,
            upper,
            confidence_level,
        })
    }

    /// Psi weights of the ARIMA representation, including the differencing
    /// operator, up to `horizon` terms
    fn psi_weights(&self, horizon: usize) -> Vec<f64> {
        let s = self.order.season;

        // AR polynomial 1 - Σ α_j B^j, with seasonal terms folded in additively
        let ar_span = self.startup_lag().max(1);
        let mut ar_poly = vec![0.0; ar_span + 1];
        ar_poly[0] = 1.0;
        for (i, phi) in self.ar.iter().enumerate() {
            ar_poly[i + 1] -= phi;
        }
        for (i, phi) in self.sar.iter().enumerate() {
            ar_poly[s * (i + 1)] -= phi;
        }

        let mut full = ar_poly;
        for _ in 0..self.order.d {
            full = stats::poly_mul(&full, &[1.0, -1.0]);
        }
        for _ in 0..self.order.sd {
            let mut seasonal = vec![0.0; s + 1];
            seasonal[0] = 1.0;
            seasonal[s] = -1.0;
            full = stats::poly_mul(&full, &seasonal);
        }

        // MA polynomial 1 + Σ β_j B^j
        let ma_span = self.order.q.max(self.order.sq * s);
        let mut ma_poly = vec![0.0; ma_span + 1];
        ma_poly[0] = 1.0;
        for (i, theta) in self.ma.iter().enumerate() {
            ma_poly[i + 1] += theta;
        }
        for (i, theta) in self.sma.iter().enumerate() {
            ma_poly[s * (i + 1)] += theta;
        }

        let mut psi = vec![0.0; horizon];
        for j in 0..horizon {
            if j == 0 {
                psi[0] = 1.0;
                continue;
            }
            let mut value = if j < ma_poly.len() { ma_poly[j] } else { 0.0 };
            for i in 1..=j.min(full.len() - 1) {
                // a_i = -full[i]
                value -= full[i] * psi[j - i];
            }
            psi[j] = value;
        }
        psi
    }
}
