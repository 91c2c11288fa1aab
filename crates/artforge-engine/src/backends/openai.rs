use std::time::Duration;

use artforge_contracts::request::parse_size;
use artforge_contracts::GenerationError;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;

use super::{
    http_client, network_error, response_json_or_error, LastResortApi, LastResortRequest,
};
use crate::config::EngineConfig;

const NAME: &str = "openai";

/// OpenAI-style synchronous images endpoint. No job, no polling: the
/// response carries the URLs directly.
#[derive(Debug, Clone)]
pub struct OpenAiImages {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageItem>,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    #[serde(default)]
    url: Option<String>,
}

impl OpenAiImages {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http: http_client(NAME, timeout)?,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, GenerationError> {
        Self::new(
            config.openai_api_base.clone(),
            config.openai_api_key.clone(),
            config.http_timeout,
        )
    }
}

impl LastResortApi for OpenAiImages {
    fn name(&self) -> &str {
        NAME
    }

    fn generate(&self, request: &LastResortRequest) -> Result<Vec<String>, GenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Configuration("OPENAI_API_KEY not set".to_string()))?;
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": request.size,
            "response_format": "url",
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(|err| network_error(NAME, &err))?;
        let body = response_json_or_error(NAME, response)?;
        let parsed: ImagesResponse =
            serde_json::from_value(body).map_err(|err| GenerationError::Decode {
                backend: NAME.to_string(),
                message: format!("unexpected images payload: {err}"),
            })?;
        let urls: Vec<String> = parsed
            .data
            .into_iter()
            .filter_map(|item| item.url)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(GenerationError::Decode {
                backend: NAME.to_string(),
                message: "images response returned no URLs".to_string(),
            });
        }
        Ok(urls)
    }
}

/// Picks the supported `WxH` size whose aspect ratio is closest to the
/// request; ties go to the earlier entry. Unparseable entries are skipped.
pub fn closest_size(sizes: &[String], width: u32, height: u32) -> Option<String> {
    let target = aspect(width, height)?;
    let mut best: Option<(f64, &String)> = None;
    for size in sizes {
        let Ok((w, h)) = parse_size(size) else {
            continue;
        };
        let Some(candidate) = aspect(w, h) else {
            continue;
        };
        let distance = (candidate - target).abs();
        if best.map(|(current, _)| distance < current).unwrap_or(true) {
            best = Some((distance, size));
        }
    }
    best.map(|(_, size)| size.clone())
}

fn aspect(width: u32, height: u32) -> Option<f64> {
    if width == 0 || height == 0 {
        return None;
    }
    Some((f64::from(width) / f64::from(height)).ln())
}
