//! Forecasting engine
//!
//! Per-(VNF type, metric) seasonal ARIMA models with adaptive retraining.
//! Fits run on the blocking pool so control-loop ticks stay responsive.
//! Every failure mode collapses to "no forecast available"; callers proceed
//! on current observations alone.

mod arima;
mod stats;

pub use arima::{fit_auto, FitConfig, Forecast, FittedModel, SarimaOrder};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ForecastingConfig;
use crate::error::{OrchestratorError, Result};
use crate::registry::OrchestratorMetrics;
use crate::types::{MetricKind, VnfType};

/// Rolling one-step prediction errors kept per model
const ERROR_WINDOW: usize = 5;

/// Mean absolute percentage error above which a model is invalidated
const MAPE_RETRAIN_THRESHOLD: f64 = 0.20;

struct ModelSlot {
    fitted: Option<FittedModel>,
    /// Total samples seen when the model was last trained
    trained_at_sample: u64,
    /// (predicted, at_sample) one-step prediction awaiting its actual value
    pending: Option<(f64, u64)>,
    recent_ape: VecDeque<f64>,
}

impl ModelSlot {
    fn new() -> Self {
        Self {
            fitted: None,
            trained_at_sample: 0,
            pending: None,
            recent_ape: VecDeque::with_capacity(ERROR_WINDOW),
        }
    }

    fn mape(&self) -> Option<f64> {
        if self.recent_ape.is_empty() {
            return None;
        }
        Some(self.recent_ape.iter().sum::<f64>() / self.recent_ape.len() as f64)
    }
}

/// Per-(type, metric) forecaster with adaptive order selection
pub struct ForecastEngine {
    config: ForecastingConfig,
    fit_config: FitConfig,
    models: DashMap<(VnfType, MetricKind), Arc<Mutex<ModelSlot>>>,
    metrics: Option<OrchestratorMetrics>,
}

impl ForecastEngine {
    pub fn new(config: ForecastingConfig, metrics: Option<OrchestratorMetrics>) -> Arc<Self> {
        Arc::new(Self {
            config,
            fit_config: FitConfig::default(),
            models: DashMap::new(),
            metrics,
        })
    }

    /// Produce an h-step forecast for the series, retraining when stale.
    ///
    /// `series` is the ring-buffer snapshot (oldest first); `total_samples`
    /// counts every sample the series has ever accepted, which drives the
    /// "M new samples" retrain rule.
    pub async fn forecast(
        &self,
        vnf: VnfType,
        metric: MetricKind,
        series: &[f64],
        total_samples: u64,
    ) -> Result<Forecast> {
        if series.len() < self.config.window_size {
            return Err(OrchestratorError::ForecastUnavailable(format!(
                "{vnf}/{metric}: {} of {} samples",
                series.len(),
                self.config.window_size
            )));
        }

        let slot = self
            .models
            .entry((vnf, metric))
            .or_insert_with(|| Arc::new(Mutex::new(ModelSlot::new())))
            .clone();
        let mut slot = slot.lock().await;

        self.score_pending(&mut slot, vnf, metric, series, total_samples);

        let retrain_after = (self.config.window_size as u64 / 4).max(1);
        let needs_fit = match &slot.fitted {
            None => true,
            Some(_) => {
                total_samples.saturating_sub(slot.trained_at_sample) >= retrain_after
                    || slot.mape().map(|m| m > MAPE_RETRAIN_THRESHOLD).unwrap_or(false)
            }
        };

        if needs_fit {
            let data = series.to_vec();
            let fit_config = self.fit_config;
            let fitted =
                tokio::task::spawn_blocking(move || fit_auto(&data, &fit_config))
                    .await
                    .map_err(|e| {
                        OrchestratorError::ForecastUnavailable(format!("fit task failed: {e}"))
                    })?;
            match fitted {
                Ok(model) => {
                    debug!(
                        vnf_type = %vnf,
                        metric = %metric,
                        order = ?model.order,
                        aic = model.aic,
                        "Forecast model trained"
                    );
                    slot.fitted = Some(model);
                    slot.trained_at_sample = total_samples;
                    slot.recent_ape.clear();
                }
                Err(e) => {
                    // A stale model is not reused after drift invalidation
                    slot.fitted = None;
                    warn!(vnf_type = %vnf, metric = %metric, error = %e, "Forecast fit failed");
                    return Err(e);
                }
            }
        }

        let model = slot
            .fitted
            .as_ref()
            .ok_or_else(|| OrchestratorError::ForecastUnavailable("no fitted model".into()))?;
        let forecast = model.forecast(
            series,
            self.config.forecast_steps,
            self.config.confidence_level,
        )?;
        slot.pending = forecast.values.first().map(|&v| (v, total_samples));
        Ok(forecast)
    }

    /// Compare the pending one-step prediction against the sample that has
    /// since arrived, feeding the accuracy metric and the drift detector
    fn score_pending(
        &self,
        slot: &mut ModelSlot,
        vnf: VnfType,
        metric: MetricKind,
        series: &[f64],
        total_samples: u64,
    ) {
        let Some((predicted, at_sample)) = slot.pending else {
            return;
        };
        // The prediction targeted the first sample after `at_sample`
        if total_samples <= at_sample {
            return;
        }
        let newer = (total_samples - at_sample) as usize;
        if newer > series.len() {
            slot.pending = None;
            return;
        }
        let actual = series[series.len() - newer];
        let ape = (predicted - actual).abs() / actual.abs().max(1e-6);
        slot.recent_ape.push_back(ape.min(10.0));
        while slot.recent_ape.len() > ERROR_WINDOW {
            slot.recent_ape.pop_front();
        }
        if let Some(metrics) = &self.metrics {
            let accuracy = (1.0 - ape).clamp(0.0, 1.0);
            metrics
                .forecast_accuracy
                .with_label_values(&[vnf.as_str(), metric.as_str()])
                .observe(accuracy);
        }
        slot.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;

    fn engine() -> Arc<ForecastEngine> {
        ForecastEngine::new(OrchestratorConfig::default().forecasting, None)
    }

    #[tokio::test]
    async fn test_insufficient_samples_unavailable() {
        let engine = engine();
        let series = vec![30.0; 5];
        let result = engine
            .forecast(VnfType::Firewall, MetricKind::Cpu, &series, 5)
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ForecastUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_constant_series_constant_forecast() {
        let engine = engine();
        let series = vec![55.0; 20];
        let forecast = engine
            .forecast(VnfType::Firewall, MetricKind::Cpu, &series, 20)
            .await
            .unwrap();
        assert_eq!(forecast.values, vec![55.0; 3]);
        assert_eq!(forecast.lower, forecast.upper);
    }

    #[tokio::test]
    async fn test_model_reused_between_retrains() {
        let engine = engine();
        let mut series: Vec<f64> = (0..20).map(|i| 40.0 + (i % 3) as f64).collect();
        engine
            .forecast(VnfType::Mail, MetricKind::Cpu, &series, 20)
            .await
            .unwrap();

        // One new sample: below the W/4 retrain threshold, model is reused
        series.remove(0);
        series.push(41.0);
        engine
            .forecast(VnfType::Mail, MetricKind::Cpu, &series, 21)
            .await
            .unwrap();

        let slot = engine
            .models
            .get(&(VnfType::Mail, MetricKind::Cpu))
            .unwrap()
            .clone();
        let slot = slot.lock().await;
        assert_eq!(slot.trained_at_sample, 20);
    }

    #[tokio::test]
    async fn test_ramp_triggers_high_forecast() {
        let engine = engine();
        let mut series = vec![30.0; 15];
        series.extend([42.0, 54.0, 66.0, 78.0, 90.0]);
        let forecast = engine
            .forecast(VnfType::Firewall, MetricKind::Cpu, &series, 20)
            .await
            .unwrap();
        assert!(forecast.values[2] > 80.0);
        assert!(forecast.exceedance_probability(2, 80.0) >= 0.7);
    }
}
