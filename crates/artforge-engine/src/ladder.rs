use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use artforge_contracts::backends::{BackendCatalog, BackendDescriptor, LastResortDescriptor};
use artforge_contracts::events::{EventLevel, EventLog, EventPayload};
use artforge_contracts::prediction::Prediction;
use artforge_contracts::request::GenerationRequest;
use artforge_contracts::{AttemptFailure, GenerationError};
use serde::Serialize;
use serde_json::json;

use crate::backends::{
    closest_size, LastResortApi, LastResortRequest, PredictionApi, PredictionSnapshot,
};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::normalize::{normalize, NormalizedInput};
use crate::poller::Poller;

/// Same-backend retry for retryable transport failures on submission.
/// Everything else advances the ladder immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub network_retries: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_retries: 1,
            pause: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            network_retries: config.network_retries,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rung {
    Primary,
    Alternate(usize),
    LastResort,
}

impl fmt::Display for Rung {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rung::Primary => f.write_str("primary"),
            Rung::Alternate(index) => write!(f, "alternate[{index}]"),
            Rung::LastResort => f.write_str("last_resort"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub rung: Rung,
    pub backend: String,
    pub error: Option<AttemptFailure>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LadderOutcome {
    pub image_url: String,
    pub backend: String,
    pub rung: Rung,
    pub prediction_id: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

/// Tries the primary backend, then each alternate in configured order, then
/// the last-resort provider at most once. Every rung re-normalizes the
/// caller's original request.
#[derive(Clone)]
pub struct FallbackLadder {
    catalog: Arc<BackendCatalog>,
    predictions: Arc<dyn PredictionApi>,
    last_resort: Option<Arc<dyn LastResortApi>>,
    poller: Poller,
    retry: RetryPolicy,
    events: EventLog,
}

impl FallbackLadder {
    pub fn new(
        catalog: Arc<BackendCatalog>,
        predictions: Arc<dyn PredictionApi>,
        last_resort: Option<Arc<dyn LastResortApi>>,
        poller: Poller,
        events: EventLog,
    ) -> Self {
        Self {
            catalog,
            predictions,
            last_resort,
            poller,
            retry: RetryPolicy::default(),
            events,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<LadderOutcome, GenerationError> {
        request.validate()?;
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for (index, backend) in self.catalog.ladder_backends().into_iter().enumerate() {
            cancel.check()?;
            let rung = if index == 0 {
                Rung::Primary
            } else {
                Rung::Alternate(index - 1)
            };
            self.attempt_started(rung, &backend.id, self.predictions.name());
            match self.run_backend(backend, request, cancel) {
                Ok((image_url, prediction_id)) => {
                    attempts.push(AttemptRecord {
                        rung,
                        backend: backend.id.clone(),
                        error: None,
                    });
                    return Ok(self.succeeded(
                        image_url,
                        &backend.id,
                        rung,
                        Some(prediction_id),
                        attempts,
                    ));
                }
                Err(err) if err.is_fatal_for_ladder() => return Err(err),
                Err(err) => attempts.push(self.attempt_failed(rung, &backend.id, &err)),
            }
        }

        if let Some(descriptor) = &self.catalog.ladder().last_resort {
            cancel.check()?;
            let rung = Rung::LastResort;
            let client = self.last_resort.as_ref().map_or("unconfigured", |api| api.name());
            self.attempt_started(rung, &descriptor.id, client);
            match self.run_last_resort(descriptor, request) {
                Ok(image_url) => {
                    attempts.push(AttemptRecord {
                        rung,
                        backend: descriptor.id.clone(),
                        error: None,
                    });
                    return Ok(self.succeeded(image_url, &descriptor.id, rung, None, attempts));
                }
                Err(err) if err.is_fatal_for_ladder() => return Err(err),
                Err(err) => attempts.push(self.attempt_failed(rung, &descriptor.id, &err)),
            }
        }

        let failures: Vec<AttemptFailure> = attempts
            .into_iter()
            .filter_map(|attempt| attempt.error)
            .collect();
        let mut payload = EventPayload::new();
        payload.insert("attempts".to_string(), json!(failures));
        self.events
            .record(EventLevel::Error, "ladder_exhausted", payload);
        Err(GenerationError::Exhausted { attempts: failures })
    }

    fn run_backend(
        &self,
        backend: &BackendDescriptor,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<(String, String), GenerationError> {
        let input = normalize(request, backend)?;
        let submitted = self.submit_with_retry(&input, cancel)?;

        let mut payload = EventPayload::new();
        payload.insert("backend".to_string(), json!(backend.id));
        payload.insert("client".to_string(), json!(self.predictions.name()));
        payload.insert("prediction_id".to_string(), json!(submitted.id));
        payload.insert("status".to_string(), json!(submitted.status));
        payload.insert("fingerprint".to_string(), json!(input.fingerprint()));
        self.events
            .record(EventLevel::Info, "prediction_submitted", payload);

        let mut prediction = Prediction::new(submitted.id.clone(), backend.id.clone(), request.clone());
        let urls = self.poller.settle(
            self.predictions.as_ref(),
            &mut prediction,
            submitted,
            &backend.output,
            cancel,
        )?;
        let image_url = first_url(&backend.id, urls)?;
        Ok((image_url, prediction.id))
    }

    fn submit_with_retry(
        &self,
        input: &NormalizedInput,
        cancel: &CancelToken,
    ) -> Result<PredictionSnapshot, GenerationError> {
        let mut retries_left = self.retry.network_retries;
        loop {
            cancel.check()?;
            match self.predictions.submit(input) {
                Err(err) if err.is_retryable_network() && retries_left > 0 => {
                    retries_left -= 1;
                    let mut payload = EventPayload::new();
                    payload.insert("backend".to_string(), json!(input.backend_id));
                    payload.insert("retries_left".to_string(), json!(retries_left));
                    payload.insert("error".to_string(), json!(err.to_string()));
                    self.events
                        .record(EventLevel::Warn, "network_retry", payload);
                    self.poller.pacer().pause(self.retry.pause, cancel)?;
                }
                other => return other,
            }
        }
    }

    fn run_last_resort(
        &self,
        descriptor: &LastResortDescriptor,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        let Some(api) = &self.last_resort else {
            return Err(GenerationError::Configuration(format!(
                "no client configured for last-resort provider '{}'",
                descriptor.id
            )));
        };
        let size = closest_size(&descriptor.sizes, request.width, request.height).ok_or_else(
            || {
                GenerationError::Configuration(format!(
                    "last-resort provider '{}' has no usable sizes",
                    descriptor.id
                ))
            },
        )?;
        let urls = api.generate(&LastResortRequest {
            model: descriptor.model.clone(),
            prompt: request.prompt.trim().to_string(),
            size,
        })?;
        first_url(&descriptor.id, urls)
    }

    fn attempt_started(&self, rung: Rung, backend: &str, client: &str) {
        let mut payload = EventPayload::new();
        payload.insert("rung".to_string(), json!(rung.to_string()));
        payload.insert("backend".to_string(), json!(backend));
        payload.insert("client".to_string(), json!(client));
        self.events
            .record(EventLevel::Info, "ladder_attempt_started", payload);
    }

    fn attempt_failed(&self, rung: Rung, backend: &str, err: &GenerationError) -> AttemptRecord {
        let failure = err.to_attempt(backend);
        let mut payload = EventPayload::new();
        payload.insert("rung".to_string(), json!(rung.to_string()));
        payload.insert("backend".to_string(), json!(backend));
        payload.insert("kind".to_string(), json!(failure.kind));
        payload.insert("error".to_string(), json!(failure.message));
        self.events
            .record(EventLevel::Warn, "ladder_attempt_failed", payload);
        AttemptRecord {
            rung,
            backend: backend.to_string(),
            error: Some(failure),
        }
    }

    fn succeeded(
        &self,
        image_url: String,
        backend: &str,
        rung: Rung,
        prediction_id: Option<String>,
        attempts: Vec<AttemptRecord>,
    ) -> LadderOutcome {
        let mut payload = EventPayload::new();
        payload.insert("rung".to_string(), json!(rung.to_string()));
        payload.insert("backend".to_string(), json!(backend));
        payload.insert("image_url".to_string(), json!(image_url));
        payload.insert("attempt_count".to_string(), json!(attempts.len()));
        self.events
            .record(EventLevel::Info, "ladder_succeeded", payload);
        LadderOutcome {
            image_url,
            backend: backend.to_string(),
            rung,
            prediction_id,
            attempts,
        }
    }
}

fn first_url(backend: &str, urls: Vec<String>) -> Result<String, GenerationError> {
    urls.into_iter()
        .next()
        .ok_or_else(|| GenerationError::Decode {
            backend: backend.to_string(),
            message: "no image URL returned".to_string(),
        })
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use artforge_contracts::backends::BackendCatalog;
    use artforge_contracts::events::EventLog;
    use artforge_contracts::request::GenerationRequest;
    use artforge_contracts::GenerationError;
    use serde_json::{json, Value};

    use super::testing::{FakeLastResort, RoutedApi};
    use super::{FallbackLadder, RetryPolicy, Rung};
    use crate::backends::PredictionSnapshot;
    use crate::cancel::CancelToken;
    use crate::poller::testing::{RecordingPacer, ScriptedApi};
    use crate::poller::{PollSettings, Poller};

    fn poller(pacer: Arc<RecordingPacer>, events: EventLog) -> Poller {
        Poller::with_pacer(
            PollSettings {
                interval: Duration::from_millis(10),
                max_attempts: 3,
            },
            pacer,
            events,
        )
    }

    fn ladder(
        api: Arc<RoutedApi>,
        last_resort: Option<Arc<FakeLastResort>>,
        events: EventLog,
    ) -> FallbackLadder {
        FallbackLadder::new(
            Arc::new(BackendCatalog::defaults()),
            api,
            last_resort.map(|fake| fake as Arc<dyn crate::backends::LastResortApi>),
            poller(Arc::new(RecordingPacer::default()), events.clone()),
            events,
        )
    }

    #[test]
    fn rejected_primary_walks_alternates_in_order_then_last_resort_once() {
        let api = Arc::new(RoutedApi::rejecting(&["flux-pro", "flux-dev", "sdxl"]));
        let fake = Arc::new(FakeLastResort::failing());
        let err = ladder(api.clone(), Some(fake.clone()), EventLog::disabled())
            .generate(&GenerationRequest::new("a bear portrait"), &CancelToken::new())
            .unwrap_err();

        assert_eq!(api.submitted_backends(), vec!["flux-pro", "flux-dev", "sdxl"]);
        assert_eq!(fake.call_count(), 1);
        let GenerationError::Exhausted { attempts } = err else {
            panic!("expected exhausted, got {err:?}");
        };
        let order: Vec<&str> = attempts.iter().map(|a| a.backend.as_str()).collect();
        assert_eq!(order, vec!["flux-pro", "flux-dev", "sdxl", "openai"]);
        assert!(attempts[..3].iter().all(|a| a.kind == "backend_rejected"));
    }

    #[test]
    fn last_resort_success_follows_every_failed_rung() {
        let api = Arc::new(RoutedApi::rejecting(&["flux-pro", "flux-dev", "sdxl"]));
        let fake = Arc::new(FakeLastResort::returning("https://x/y.png"));
        let outcome = ladder(api, Some(fake.clone()), EventLog::disabled())
            .generate(
                &GenerationRequest::new("a bear portrait").with_size(1440, 810),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(outcome.image_url, "https://x/y.png");
        assert_eq!(outcome.rung, Rung::LastResort);
        assert_eq!(outcome.attempts.len(), 4);
        assert!(outcome.attempts[..3].iter().all(|a| !a.succeeded()));
        assert!(outcome.attempts[3].succeeded());

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0].prompt, "a bear portrait");
        assert_eq!(calls[0].model, "dall-e-3");
        assert_eq!(calls[0].size, "1792x1024");
    }

    #[test]
    fn each_rung_renormalizes_the_original_request() {
        let api = Arc::new(RoutedApi::rejecting(&["flux-pro", "flux-dev"]));
        let outcome = ladder(api.clone(), None, EventLog::disabled())
            .generate(
                &GenerationRequest::new("a bear portrait").with_size(1440, 1440),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(outcome.backend, "sdxl");
        assert_eq!(outcome.rung, Rung::Alternate(1));
        assert_eq!(outcome.image_url, "https://img/sdxl.png");
        let submissions = api.submissions.lock().unwrap();
        assert_eq!(submissions[0].input["width"], json!(1440));
        assert_eq!(submissions[1].input["width"], json!(1024));
        assert_eq!(submissions[2].input["width"], json!(1024));
        assert_eq!(submissions[2].input["guidance_scale"], json!(7.5));
        assert!(submissions[1].input.get("guidance_scale").is_none());
    }

    #[test]
    fn primary_success_stops_the_ladder() {
        let api = Arc::new(RoutedApi::default());
        let fake = Arc::new(FakeLastResort::returning("https://x/y.png"));
        let outcome = ladder(api.clone(), Some(fake.clone()), EventLog::disabled())
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.rung, Rung::Primary);
        assert_eq!(outcome.prediction_id.as_deref(), Some("p-flux-pro"));
        assert_eq!(api.submitted_backends(), vec!["flux-pro"]);
        assert_eq!(fake.call_count(), 0);
    }

    #[test]
    fn missing_last_resort_client_is_recorded_as_a_failure() {
        let api = Arc::new(RoutedApi::rejecting(&["flux-pro", "flux-dev", "sdxl"]));
        let err = ladder(api, None, EventLog::disabled())
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())
            .unwrap_err();
        let GenerationError::Exhausted { attempts } = err else {
            panic!("expected exhausted");
        };
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts[3].kind, "configuration");
    }

    #[test]
    fn invalid_request_never_reaches_a_backend() {
        let api = Arc::new(RoutedApi::default());
        let err = ladder(api.clone(), None, EventLog::disabled())
            .generate(&GenerationRequest::new("  "), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, GenerationError::Validation(_)));
        assert!(api.submitted_backends().is_empty());
    }

    #[test]
    fn cancellation_stops_the_ladder() {
        let api = Arc::new(RoutedApi::default());
        let cancel = CancelToken::new();
        cancel.cancel("shutdown");
        let err = ladder(api.clone(), None, EventLog::disabled())
            .generate(&GenerationRequest::new("bear"), &cancel)
            .unwrap_err();
        assert_eq!(err, GenerationError::Cancelled("shutdown".to_string()));
        assert!(api.submitted_backends().is_empty());
    }

    #[test]
    fn retryable_network_failure_retries_same_backend_before_advancing() {
        let network = || {
            Err(GenerationError::Network {
                backend: "flux-pro".to_string(),
                message: "connection reset".to_string(),
                retryable: true,
            })
        };
        let api = ScriptedApi::new(
            vec![
                network(),
                Ok(PredictionSnapshot::succeeded("p-9", json!("https://x/retry.png"))),
            ],
            Vec::new(),
        );
        let pacer = Arc::new(RecordingPacer::default());
        let ladder = FallbackLadder::new(
            Arc::new(BackendCatalog::defaults()),
            api.clone(),
            None,
            poller(pacer.clone(), EventLog::disabled()),
            EventLog::disabled(),
        )
        .with_retry(RetryPolicy {
            network_retries: 1,
            pause: Duration::from_millis(250),
        });
        let outcome = ladder
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.rung, Rung::Primary);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(api.submissions.lock().unwrap().len(), 2);
        assert_eq!(
            *pacer.pauses.lock().unwrap(),
            vec![Duration::from_millis(250)]
        );
    }

    #[test]
    fn exhausted_retries_advance_the_ladder() {
        let api = ScriptedApi::new(
            vec![
                Err(GenerationError::Network {
                    backend: "flux-pro".to_string(),
                    message: "timed out".to_string(),
                    retryable: true,
                }),
                Err(GenerationError::Network {
                    backend: "flux-pro".to_string(),
                    message: "timed out".to_string(),
                    retryable: true,
                }),
                Ok(PredictionSnapshot::succeeded("p-2", json!(["https://x/dev.png"]))),
            ],
            Vec::new(),
        );
        let ladder = FallbackLadder::new(
            Arc::new(BackendCatalog::defaults()),
            api.clone(),
            None,
            poller(Arc::new(RecordingPacer::default()), EventLog::disabled()),
            EventLog::disabled(),
        )
        .with_retry(RetryPolicy {
            network_retries: 1,
            pause: Duration::from_millis(1),
        });
        let outcome = ladder
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.backend, "flux-dev");
        assert_eq!(outcome.attempts[0].error.as_ref().unwrap().kind, "network");
        let backends: Vec<String> = api
            .submissions
            .lock()
            .unwrap()
            .iter()
            .map(|input| input.backend_id.clone())
            .collect();
        assert_eq!(backends, vec!["flux-pro", "flux-pro", "flux-dev"]);
    }

    fn scripted_ladder(
        api: Arc<ScriptedApi>,
        last_resort: Arc<FakeLastResort>,
        events: EventLog,
    ) -> FallbackLadder {
        FallbackLadder::new(
            Arc::new(BackendCatalog::defaults()),
            api,
            Some(last_resort as Arc<dyn crate::backends::LastResortApi>),
            poller(Arc::new(RecordingPacer::default()), events.clone()),
            events,
        )
    }

    fn read_events(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
        Ok(std::fs::read_to_string(path)?
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<Value>, _>>()?)
    }

    #[test]
    fn poll_timeouts_advance_every_rung_to_the_last_resort() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let api = ScriptedApi::new(
            vec![Ok(PredictionSnapshot::pending("p-slow"))],
            vec![Ok(PredictionSnapshot::pending("p-slow"))],
        );
        let fake = Arc::new(FakeLastResort::returning("https://x/y.png"));
        let outcome = scripted_ladder(api.clone(), fake.clone(), EventLog::new(&path, "s-2"))
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())?;

        let kinds: Vec<&str> = outcome
            .attempts
            .iter()
            .map(|a| a.error.as_ref().map_or("ok", |e| e.kind.as_str()))
            .collect();
        assert_eq!(kinds, vec!["poll_timeout", "poll_timeout", "poll_timeout", "ok"]);
        let backends: Vec<&str> = outcome.attempts.iter().map(|a| a.backend.as_str()).collect();
        assert_eq!(backends, vec!["flux-pro", "flux-dev", "sdxl", "openai"]);
        assert_eq!(outcome.rung, Rung::LastResort);
        assert_eq!(api.fetch_count(), 9);
        assert_eq!(fake.call_count(), 1);

        let clients: Vec<String> = read_events(&path)?
            .into_iter()
            .filter(|event| event["type"] == "ladder_attempt_started")
            .filter_map(|event| event["client"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            clients,
            vec!["scripted", "scripted", "scripted", "fake-last-resort"]
        );
        Ok(())
    }

    #[test]
    fn backend_failures_from_polling_advance_the_ladder() {
        let api = ScriptedApi::new(
            vec![Ok(PredictionSnapshot::pending("p-1"))],
            vec![Ok(PredictionSnapshot::failed("p-1", "NSFW content detected"))],
        );
        let fake = Arc::new(FakeLastResort::failing());
        let err = scripted_ladder(api.clone(), fake.clone(), EventLog::disabled())
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())
            .unwrap_err();

        let GenerationError::Exhausted { attempts } = err else {
            panic!("expected exhausted, got {err:?}");
        };
        let kinds: Vec<&str> = attempts.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["backend_failure", "backend_failure", "backend_failure", "backend_rejected"]
        );
        let backends: Vec<&str> = attempts.iter().map(|a| a.backend.as_str()).collect();
        assert_eq!(backends, vec!["flux-pro", "flux-dev", "sdxl", "openai"]);
        assert_eq!(api.fetch_count(), 3);
        assert_eq!(fake.call_count(), 1);
    }

    #[test]
    fn ladder_events_are_written_in_attempt_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let api = Arc::new(RoutedApi::rejecting(&["flux-pro"]));
        ladder(api, None, EventLog::new(&path, "s-1"))
            .generate(&GenerationRequest::new("bear"), &CancelToken::new())?;

        let types: Vec<String> = std::fs::read_to_string(&path)?
            .lines()
            .map(|line| serde_json::from_str::<Value>(line))
            .collect::<Result<Vec<Value>, _>>()?
            .into_iter()
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                "ladder_attempt_started",
                "ladder_attempt_failed",
                "ladder_attempt_started",
                "prediction_submitted",
                "prediction_resolved",
                "ladder_succeeded",
            ]
        );
        Ok(())
    }
}
