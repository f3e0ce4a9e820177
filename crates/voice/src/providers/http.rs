//! HTTP provider adapters.
//!
//! Thin reqwest clients against external streaming providers. Each call
//! runs under the caller's [`CallContext`], so deadlines and
//! cancellation apply uniformly; provider-reported failures map to
//! `ProviderError`, connectivity problems to `ProviderUnavailable`.

use async_trait::async_trait;
use serde::Deserialize;

use voxgate_core::{
    CallContext, Error, HistoryTurn, LanguageModel, Result, SpeechToText, SynthesizedAudio,
    TextToSpeech, Transcript, TurnOutcome, VoiceTuning,
};

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub stt_endpoint: String,
    pub llm_endpoint: String,
    pub tts_endpoint: String,
    pub api_key: String,
}

fn post(client: &reqwest::Client, endpoint: &str, api_key: &str) -> reqwest::RequestBuilder {
    let mut request = client.post(endpoint);
    if !api_key.is_empty() {
        request = request.bearer_auth(api_key);
    }
    request
}

fn transport_error(provider: &str, e: reqwest::Error) -> Error {
    Error::ProviderUnavailable {
        provider: provider.to_string(),
        message: e.to_string(),
    }
}

fn status_error(provider: &str, response: &reqwest::Response) -> Option<Error> {
    let status = response.status();
    if status.is_success() {
        return None;
    }
    let correlation_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    Some(if status.is_server_error() {
        Error::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("status {status}"),
        }
    } else {
        Error::ProviderError {
            provider: provider.to_string(),
            message: format!("status {status}"),
            correlation_id,
        }
    })
}

pub struct HttpSpeechToText {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpSpeechToText {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Deserialize)]
struct SttResponse {
    text: String,
    #[serde(default)]
    confidence: f32,
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        ctx: &CallContext,
        audio: &[u8],
        language: &str,
    ) -> Result<Transcript> {
        let request = post(&self.client, &self.config.stt_endpoint, &self.config.api_key)
            .query(&[("language", language)])
            .header("content-type", "application/octet-stream")
            .body(audio.to_vec());

        let body: SttResponse = ctx
            .run("stt", async {
                let response = request.send().await.map_err(|e| transport_error("stt", e))?;
                if let Some(err) = status_error("stt", &response) {
                    return Err(err);
                }
                response.json().await.map_err(|e| transport_error("stt", e))
            })
            .await?;

        Ok(Transcript {
            text: body.text,
            confidence: body.confidence,
            language: language.to_string(),
        })
    }

    fn name(&self) -> &str {
        "http-stt"
    }
}

pub struct HttpTurnModel {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpTurnModel {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl LanguageModel for HttpTurnModel {
    async fn generate_turn(
        &self,
        ctx: &CallContext,
        system_prompt: &str,
        history: &[HistoryTurn],
        transcript: &str,
    ) -> Result<TurnOutcome> {
        // The provider is asked for the structured-output contract: a
        // reply plus explicit intent booleans.
        let payload = serde_json::json!({
            "system": system_prompt,
            "history": history,
            "input": transcript,
            "response_format": {
                "reply": "string",
                "lead_qualified": "boolean",
                "needs_transfer": "boolean",
                "conversation_ended": "boolean",
            },
        });
        let request = post(&self.client, &self.config.llm_endpoint, &self.config.api_key)
            .json(&payload);

        let outcome: TurnOutcome = ctx
            .run("llm", async {
                let response = request.send().await.map_err(|e| transport_error("llm", e))?;
                if let Some(err) = status_error("llm", &response) {
                    return Err(err);
                }
                response.json().await.map_err(|e| {
                    // A well-reachable provider returning garbage is a
                    // provider error, not an outage.
                    Error::ProviderError {
                        provider: "llm".to_string(),
                        message: format!("malformed structured output: {e}"),
                        correlation_id: None,
                    }
                })
            })
            .await?;

        Ok(outcome)
    }

    fn name(&self) -> &str {
        "http-llm"
    }
}

pub struct HttpTextToSpeech {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpTextToSpeech {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TextToSpeech for HttpTextToSpeech {
    async fn synthesize(
        &self,
        ctx: &CallContext,
        voice_id: &str,
        tuning: &VoiceTuning,
        language: &str,
        text: &str,
    ) -> Result<SynthesizedAudio> {
        let payload = serde_json::json!({
            "voice_id": voice_id,
            "language": language,
            "text": text,
            "settings": {
                "stability": tuning.stability,
                "similarity": tuning.similarity,
                "style": tuning.style,
                "speaker_boost": tuning.speaker_boost,
            },
        });
        let request = post(&self.client, &self.config.tts_endpoint, &self.config.api_key)
            .json(&payload);

        ctx.run("tts", async {
            let response = request.send().await.map_err(|e| transport_error("tts", e))?;
            if let Some(err) = status_error("tts", &response) {
                return Err(err);
            }
            let duration_ms = response
                .headers()
                .get("x-audio-duration-ms")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| transport_error("tts", e))?;
            Ok(SynthesizedAudio {
                bytes: bytes.to_vec(),
                duration_ms,
                quality: None,
            })
        })
        .await
    }

    fn name(&self) -> &str {
        "http-tts"
    }
}
