use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::io::Storage;

const TRUSTED_CLIENT_TOKEN: &str = "6A5AA1D4EAFF4E9FB37E23D68491D6F4";
const LIST_VOICES_URL: &str =
    "https://speech.platform.bing.com/consumer/speech/synthesize/readaloud/voices/list";

/// A voice as the synthesis backend reports it.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Voice {
    pub short_name: String,
    pub gender: String,
    pub locale: String,
    pub friendly_name: Option<String>,
}

/// Speech-synthesis capability the pipeline consumes. `synthesize` succeeding
/// means the artifact is retrievable at `destination`.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn list_voices(&self) -> Result<Vec<Voice>>;
    async fn synthesize(&self, text: &str, voice_id: &str, destination: &str) -> Result<()>;
}

/// Self-hosted Edge speech gateway exposing the OpenAI-style speech route.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechGatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:5050".to_string()
}

impl Default for SpeechGatewayConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            api_key: None,
        }
    }
}

pub struct EdgeGatewayClient {
    config: SpeechGatewayConfig,
    client: reqwest::Client,
    storage: Arc<dyn Storage>,
}

impl EdgeGatewayClient {
    pub fn new(config: SpeechGatewayConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            storage,
        }
    }
}

#[async_trait]
impl SynthesisProvider for EdgeGatewayClient {
    async fn list_voices(&self) -> Result<Vec<Voice>> {
        let url = format!("{LIST_VOICES_URL}?trustedclienttoken={TRUSTED_CLIENT_TOKEN}");
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authority",
            HeaderValue::from_static("speech.platform.bing.com"),
        );
        headers.insert("Accept", HeaderValue::from_static("*/*"));

        let resp = self.client.get(&url).headers(headers).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Failed to list voices: {}", resp.status()));
        }
        Ok(resp.json().await?)
    }

    async fn synthesize(&self, text: &str, voice_id: &str, destination: &str) -> Result<()> {
        let url = format!(
            "{}/v1/audio/speech",
            self.config.gateway_url.trim_end_matches('/')
        );
        let body = json!({
            "input": text,
            "voice": voice_id,
            "response_format": "mp3",
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Speech gateway error {status}: {error_text}"));
        }

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            audio.extend_from_slice(&chunk?);
        }
        if audio.is_empty() {
            return Err(anyhow!("Speech gateway returned an empty body for {voice_id}"));
        }

        debug!("synthesized {} bytes with {voice_id}", audio.len());
        self.storage.write(destination, &audio).await
    }
}
