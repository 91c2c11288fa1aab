pub mod agents;
pub mod backends;
pub mod cancel;
pub mod config;
pub mod decode;
pub mod ladder;
pub mod normalize;
pub mod poller;
pub mod text;

use std::sync::Arc;

use artforge_contracts::backends::BackendCatalog;
use artforge_contracts::events::{EventLevel, EventLog, EventPayload};
use artforge_contracts::request::GenerationRequest;
use artforge_contracts::GenerationError;
use serde_json::json;

use crate::agents::{ChainInput, ChainResult, Director, DirectorSettings};
use crate::backends::{LastResortApi, OpenAiImages, PredictionApi, ReplicateApi};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::ladder::{FallbackLadder, LadderOutcome, RetryPolicy};
use crate::poller::{PollSettings, Poller};
use crate::text::{OpenAiChat, TextCompleter};

/// Wires the catalog, HTTP clients, ladder and director for one process.
/// Everything it holds is read-only after construction.
pub struct ArtEngine {
    ladder: FallbackLadder,
    director: Director,
    events: EventLog,
}

impl ArtEngine {
    pub fn new(
        config: EngineConfig,
        settings: DirectorSettings,
        events: EventLog,
    ) -> anyhow::Result<Self> {
        let catalog = config.load_catalog()?;
        let predictions: Arc<dyn PredictionApi> = Arc::new(ReplicateApi::from_config(&config)?);
        let last_resort: Arc<dyn LastResortApi> = Arc::new(OpenAiImages::from_config(&config)?);
        let text: Arc<dyn TextCompleter> = Arc::new(OpenAiChat::from_config(&config)?);
        Ok(Self::from_parts(
            &config,
            catalog,
            predictions,
            Some(last_resort),
            text,
            settings,
            events,
        ))
    }

    pub fn from_parts(
        config: &EngineConfig,
        catalog: BackendCatalog,
        predictions: Arc<dyn PredictionApi>,
        last_resort: Option<Arc<dyn LastResortApi>>,
        text: Arc<dyn TextCompleter>,
        settings: DirectorSettings,
        events: EventLog,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let poller = Poller::new(PollSettings::from_config(config), events.clone());
        let ladder = FallbackLadder::new(
            catalog,
            predictions,
            last_resort,
            poller,
            events.clone(),
        )
        .with_retry(RetryPolicy::from_config(config));
        let director = Director::new(text, ladder.clone(), settings, events.clone());
        Self {
            ladder,
            director,
            events,
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Ladder only: no agent steps, the prompt goes straight to the backends.
    pub fn generate_image(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<LadderOutcome, GenerationError> {
        self.ladder.generate(request, cancel)
    }

    pub fn run_chain(&self, input: &ChainInput, cancel: &CancelToken) -> ChainResult {
        self.director.run(input, cancel)
    }

    pub fn record_artifacts(&self, paths: &[(&str, &std::path::Path)]) {
        let mut payload = EventPayload::new();
        for (key, path) in paths {
            payload.insert(
                (*key).to_string(),
                json!(path.to_string_lossy().to_string()),
            );
        }
        self.events
            .record(EventLevel::Info, "artifacts_written", payload);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use artforge_contracts::backends::BackendCatalog;
    use artforge_contracts::events::EventLog;
    use artforge_contracts::request::GenerationRequest;

    use super::ArtEngine;
    use crate::agents::{ChainInput, DirectorSettings};
    use crate::backends::LastResortApi;
    use crate::cancel::CancelToken;
    use crate::config::EngineConfig;
    use crate::ladder::testing::{FakeLastResort, RoutedApi};
    use crate::text::testing::ScriptedCompleter;

    fn engine(api: Arc<RoutedApi>, text: Arc<ScriptedCompleter>) -> ArtEngine {
        ArtEngine::from_parts(
            &EngineConfig::default(),
            BackendCatalog::defaults(),
            api,
            Some(Arc::new(FakeLastResort::returning("https://x/y.png")) as Arc<dyn LastResortApi>),
            text,
            DirectorSettings::default(),
            EventLog::disabled(),
        )
    }

    #[test]
    fn generate_image_skips_the_agent_chain() {
        let api = Arc::new(RoutedApi::rejecting(&["flux-pro"]));
        let text = Arc::new(ScriptedCompleter::default());
        let outcome = engine(api.clone(), text.clone())
            .generate_image(&GenerationRequest::new("a bear portrait"), &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.backend, "flux-dev");
        assert_eq!(text.call_count(), 0);
    }

    #[test]
    fn chain_failure_is_reported_not_raised() {
        let api = Arc::new(RoutedApi::default());
        let text = Arc::new(ScriptedCompleter::default());
        let result = engine(api, text).run_chain(&ChainInput::new("a bear portrait"), &CancelToken::new());
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
