use std::sync::Arc;
use std::time::Duration;

use artforge_contracts::backends::OutputShape;
use artforge_contracts::events::{EventLevel, EventLog, EventPayload};
use artforge_contracts::prediction::{Prediction, PredictionStatus};
use artforge_contracts::GenerationError;
use serde_json::{json, Value};

use crate::backends::{PredictionApi, PredictionSnapshot};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::decode::decode_output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            max_attempts: 30,
        }
    }
}

impl PollSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.poll_attempts.max(1),
        }
    }
}

/// How the poller waits between status checks.
pub trait Pacer: Send + Sync {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> Result<(), GenerationError>;
}

/// Sleeps on the cancel token so a cancel wakes the wait immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelPacer;

impl Pacer for CancelPacer {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> Result<(), GenerationError> {
        cancel.wait(duration)
    }
}

/// Drives a submitted prediction to a terminal state with a bounded number
/// of status checks.
#[derive(Clone)]
pub struct Poller {
    settings: PollSettings,
    pacer: Arc<dyn Pacer>,
    events: EventLog,
}

impl Poller {
    pub fn new(settings: PollSettings, events: EventLog) -> Self {
        Self::with_pacer(settings, Arc::new(CancelPacer), events)
    }

    pub fn with_pacer(settings: PollSettings, pacer: Arc<dyn Pacer>, events: EventLog) -> Self {
        Self {
            settings,
            pacer,
            events,
        }
    }

    pub(crate) fn pacer(&self) -> &dyn Pacer {
        self.pacer.as_ref()
    }

    /// Applies the submission response first; a submission that already came
    /// back terminal is never polled.
    pub fn settle(
        &self,
        api: &dyn PredictionApi,
        prediction: &mut Prediction,
        submitted: PredictionSnapshot,
        shape: &OutputShape,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, GenerationError> {
        if submitted.status.is_terminal() {
            return self.finish(prediction, submitted, shape, 0);
        }
        self.resolve(api, prediction, shape, cancel)
    }

    /// Fetches status up to `max_attempts` times, pausing between checks.
    /// Exhausting the attempts yields `PollTimeout`, which is distinct from a
    /// backend-reported failure; the prediction itself stays pending.
    pub fn resolve(
        &self,
        api: &dyn PredictionApi,
        prediction: &mut Prediction,
        shape: &OutputShape,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, GenerationError> {
        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            cancel.check()?;
            match api.fetch(prediction) {
                Ok(snapshot) if snapshot.status.is_terminal() => {
                    return self.finish(prediction, snapshot, shape, attempt);
                }
                Ok(_) => {}
                Err(err) if err.is_retryable_network() => {
                    let mut payload = EventPayload::new();
                    payload.insert("prediction_id".to_string(), json!(prediction.id));
                    payload.insert("backend".to_string(), json!(prediction.backend_id));
                    payload.insert("attempt".to_string(), json!(attempt));
                    payload.insert("error".to_string(), json!(err.to_string()));
                    self.events
                        .record(EventLevel::Warn, "network_retry", payload);
                }
                Err(err) => return Err(err),
            }
            if attempt < max_attempts {
                self.pacer.pause(self.settings.interval, cancel)?;
            }
        }
        Err(GenerationError::PollTimeout {
            prediction_id: prediction.id.clone(),
            attempts: max_attempts,
        })
    }

    fn finish(
        &self,
        prediction: &mut Prediction,
        snapshot: PredictionSnapshot,
        shape: &OutputShape,
        checks: u32,
    ) -> Result<Vec<String>, GenerationError> {
        let outcome = match snapshot.status {
            PredictionStatus::Succeeded => {
                match decode_output(&prediction.backend_id, shape, &snapshot.output) {
                    Ok(urls) => {
                        prediction.mark_succeeded(urls.clone());
                        Ok(urls)
                    }
                    Err(err) => {
                        prediction.mark_failed(err.to_string());
                        Err(err)
                    }
                }
            }
            _ => {
                let reason = snapshot
                    .error
                    .unwrap_or_else(|| "backend reported failure without a reason".to_string());
                prediction.mark_failed(reason.clone());
                Err(GenerationError::BackendFailure {
                    prediction_id: prediction.id.clone(),
                    reason,
                })
            }
        };

        let mut payload = EventPayload::new();
        payload.insert("prediction_id".to_string(), json!(prediction.id));
        payload.insert("backend".to_string(), json!(prediction.backend_id));
        payload.insert("status".to_string(), json!(prediction.status()));
        payload.insert("status_checks".to_string(), json!(checks));
        if let Some(error) = prediction.error() {
            payload.insert("error".to_string(), Value::String(error.to_string()));
        }
        self.events
            .record(EventLevel::Info, "prediction_resolved", payload);
        outcome
    }
}
