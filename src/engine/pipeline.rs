use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, InputError};
use crate::indicators::{Indicator, RdcExtractor};
use crate::ml::hmm::{extract_regime_observations, BaumWelch, FitReport, GaussianHmm, RegimeDetector};
use crate::ml::{ForecastProvider, ForecastResult};
use crate::strategies::{SignalEngine, SignalRecord};
use crate::types::{PricePoint, PriceSeries};

/// Observations kept for replay when a retrained model is swapped in.
pub const DEFAULT_HISTORY_CAPACITY: usize = 5_000;

/// Bar-by-bar orchestration: RDC extraction, regime filtering and the
/// decision table.
pub struct SignalPipeline {
    config: EngineConfig,
    extractor: RdcExtractor,
    engine: SignalEngine,
    detector: Option<RegimeDetector>,
    provider: Option<Box<dyn ForecastProvider>>,
    last_timestamp: Option<DateTime<Utc>>,
    history_capacity: usize,
}

impl SignalPipeline {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let extractor = RdcExtractor::new(&config.dc)?;
        let engine = SignalEngine::new(config.signal.clone(), config.roles, config.hmm.num_states)?;

        Ok(Self {
            config,
            extractor,
            engine,
            detector: None,
            provider: None,
            last_timestamp: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        })
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Use an already trained model.
    pub fn with_model(mut self, hmm: GaussianHmm) -> Result<Self, EngineError> {
        self.check_states(&hmm)?;
        self.detector = Some(RegimeDetector::new(hmm, self.history_capacity));
        Ok(self)
    }

    pub fn with_provider(mut self, provider: Box<dyn ForecastProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> Option<Arc<GaussianHmm>> {
        self.detector.as_ref().map(|d| d.model())
    }

    pub fn bars_seen(&self) -> usize {
        self.extractor.bars_seen()
    }

    fn check_states(&self, hmm: &GaussianHmm) -> Result<(), EngineError> {
        if hmm.n_states() != self.config.hmm.num_states {
            return Err(EngineError::Config(vec![format!(
                "model has {} states but hmm.num_states is {}",
                hmm.n_states(),
                self.config.hmm.num_states
            )]));
        }
        Ok(())
    }

    /// Train on the RDC index of `prices`. An existing model is replaced only
    /// if training succeeds.
    pub fn fit(&mut self, prices: &PriceSeries) -> Result<FitReport, EngineError> {
        let observations = extract_regime_observations(prices.as_slice(), &self.config.dc)?;
        info!(
            "Extracted {} RDC observations from {} bars (theta {}, window {})",
            observations.len(),
            prices.len(),
            self.config.dc.theta,
            self.config.dc.window
        );

        let trainer = BaumWelch::new(self.config.hmm.clone())?;
        let values = observations.values();

        let report = match self.detector.as_mut() {
            Some(detector) => detector.retrain(&trainer, &values)?,
            None => {
                let trained = trainer.fit(&values)?;
                self.detector = Some(RegimeDetector::new(trained.model, self.history_capacity));
                trained.report
            }
        };
        Ok(report)
    }

    /// Process one live bar. `None` during RDC warm-up. A rejected bar leaves
    /// the pipeline as it was.
    pub fn on_bar(
        &mut self,
        bar: &PricePoint,
        forecast: &ForecastResult,
    ) -> Result<Option<SignalRecord>, EngineError> {
        let detector = self.detector.as_mut().ok_or(EngineError::NotFitted)?;

        if let Some(previous) = self.last_timestamp {
            if bar.timestamp <= previous {
                return Err(InputError::OutOfOrder {
                    timestamp: bar.timestamp.to_rfc3339(),
                    previous: previous.to_rfc3339(),
                }
                .into());
            }
        }
        forecast.validate()?;

        let mut extractor = self.extractor.clone();
        let rdc = extractor.update(bar)?;

        let probabilities = match &rdc {
            Some(value) => Some(detector.observe(value.value)?),
            None => None,
        };
        self.extractor = extractor;
        self.last_timestamp = Some(bar.timestamp);

        let Some(probabilities) = probabilities else {
            debug!("Warming up: {}/{} bars", self.extractor.bars_seen(), self.config.dc.window);
            return Ok(None);
        };

        let record = self.engine.evaluate(bar.timestamp, &probabilities, forecast)?;
        debug!(
            "{} {} via {:?} (probabilities {:?})",
            record.timestamp,
            record.signal,
            record.rule,
            record.probabilities.as_slice()
        );
        Ok(Some(record))
    }

    /// Like [`on_bar`](Self::on_bar), with the forecast taken from the
    /// configured provider.
    pub fn on_bar_with_features(
        &mut self,
        bar: &PricePoint,
        features: &[f64],
    ) -> Result<Option<SignalRecord>, EngineError> {
        if self.detector.is_none() {
            return Err(EngineError::NotFitted);
        }
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| EngineError::Forecast(anyhow::anyhow!("no forecast provider configured")))?;
        let forecast = provider.forecast(features).map_err(EngineError::Forecast)?;
        self.on_bar(bar, &forecast)
    }

    /// Batch evaluation with full-sequence smoothing. `forecasts` holds one
    /// forecast per bar; a record is produced for every usable bar past
    /// warm-up. A bar whose inputs are rejected is logged and skipped.
    pub fn run(&self, prices: &PriceSeries, forecasts: &[ForecastResult]) -> Result<Vec<SignalRecord>, EngineError> {
        let detector = self.detector.as_ref().ok_or(EngineError::NotFitted)?;
        if forecasts.len() != prices.len() {
            return Err(InputError::ForecastCount { expected: prices.len(), got: forecasts.len() }.into());
        }

        let observations = extract_regime_observations(prices.as_slice(), &self.config.dc)?;
        if observations.is_empty() {
            return Ok(Vec::new());
        }

        let model = detector.model();
        let smoothed = model.state_probabilities(&observations.values())?;

        let mut records = Vec::with_capacity(smoothed.len());
        let mut rejected = 0usize;
        for (rdc, probabilities) in observations.rdc().iter().zip(&smoothed) {
            match self.engine.evaluate(rdc.timestamp, probabilities, &forecasts[rdc.index]) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping bar {} ({}): {}", rdc.index, rdc.timestamp, e);
                    rejected += 1;
                }
            }
        }

        info!(
            "Evaluated {} bars, {} signals, {} rejected",
            prices.len(),
            records.len(),
            rejected
        );
        Ok(records)
    }

    /// Forget streamed bars. The model is kept.
    pub fn reset(&mut self) {
        self.extractor.reset();
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
        self.last_timestamp = None;
    }
}
