use crate::config::{Config, SafetySetting};
use crate::error::ProviderError;
use crate::session::{Role, Turn};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Events emitted while consuming a streamed completion
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// Text delta from the streaming response
    TextDelta(String),
    /// Provider withheld content for policy reasons
    SafetyBlocked { reason: String },
    /// Stream completed
    StreamComplete,
    /// Error occurred after the stream was established
    Error(String),
}

/// Source of streamed completions for a turn history.
///
/// Failures establishing the call surface as `Err`; failures after the
/// stream starts arrive as [`LlmEvent::Error`] on the channel.
pub trait CompletionProvider {
    async fn stream_reply(
        &self,
        turns: &[Turn],
    ) -> Result<mpsc::Receiver<LlmEvent>, ProviderError>;
}

/// Streaming client for the Gemini generateContent API
#[derive(Clone)]
pub struct GeminiClient {
    config: Config,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: Config) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn api_url(&self, api_key: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            api_key
        )
    }

    /// Build the JSON request body for the Gemini API.
    ///
    /// History turns become `contents` entries with roles `user`/`model`;
    /// system turns are lifted into `systemInstruction`.
    fn build_request_body(turns: &[Turn], safety_settings: &[SafetySetting]) -> Value {
        let mut contents = Vec::new();

        for turn in turns {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "model",
                Role::System => continue, // handled via systemInstruction
            };
            contents.push(serde_json::json!({
                "role": role,
                "parts": [{ "text": turn.content }]
            }));
        }

        let safety: Vec<Value> = safety_settings
            .iter()
            .map(|s| {
                serde_json::json!({
                    "category": s.category,
                    "threshold": s.threshold,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "safetySettings": safety,
        });

        if let Some(turn) = turns.iter().find(|t| t.role == Role::System) {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": turn.content }]
            });
        }

        body
    }
}

impl CompletionProvider for GeminiClient {
    /// Stream a reply to the given turn history
    async fn stream_reply(
        &self,
        turns: &[Turn],
    ) -> Result<mpsc::Receiver<LlmEvent>, ProviderError> {
        let api_key = self
            .config
            .get_api_key()
            .ok_or(ProviderError::MissingApiKey)?;

        let url = self.api_url(&api_key);
        let body = Self::build_request_body(turns, &self.config.safety_settings);

        let (tx, rx) = mpsc::channel(1000);
        let client = self.client.clone();

        // Spawn streaming task; any failure is forwarded as an event
        let tx_clone = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_from_api(client, url, body, tx).await {
                let _ = tx_clone.send(LlmEvent::Error(e.to_string())).await;
            }
        });

        Ok(rx)
    }
}

/// Issue the request and forward stream events over the channel
async fn stream_from_api(
    client: reqwest::Client,
    url: String,
    body: Value,
    tx: mpsc::Sender<LlmEvent>,
) -> Result<(), ProviderError> {
    let response = client
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        return Err(ProviderError::Api { status, message });
    }

    process_sse_stream(response, tx).await
}

/// Process the Server-Sent Events stream from `alt=sse`.
///
/// Network chunks can split a multibyte UTF-8 sequence, so raw bytes are
/// buffered and only complete sequences are decoded per chunk.
async fn process_sse_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<LlmEvent>,
) -> Result<(), ProviderError> {
    let mut stream = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        pending.extend_from_slice(&chunk);
        buffer.push_str(&decode_complete_prefix(&mut pending));

        // Process complete lines
        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].trim().to_string();
            buffer = buffer[newline_pos + 1..].to_string();

            for event in parse_data_line(&line) {
                let blocked = matches!(event, LlmEvent::SafetyBlocked { .. });
                let _ = tx.send(event).await;
                if blocked {
                    // Nothing after a block is worth consuming
                    return Ok(());
                }
            }
        }
    }

    // Flush any remaining buffer line (without newline); a sequence still
    // truncated when the stream ends can only decode lossily
    buffer.push_str(&String::from_utf8_lossy(&pending));
    for event in parse_data_line(buffer.trim()) {
        let _ = tx.send(event).await;
    }

    let _ = tx.send(LlmEvent::StreamComplete).await;
    Ok(())
}

/// Decode the longest UTF-8-complete prefix of `bytes`, leaving a
/// sequence truncated by a chunk boundary in place for the next chunk.
/// Genuinely invalid bytes become replacement characters.
fn decode_complete_prefix(bytes: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(bytes.as_slice()) {
            Ok(valid) => {
                text.push_str(valid);
                bytes.clear();
                return text;
            }
            // Unexpected end of input: hold the incomplete tail back
            // until more bytes arrive
            Err(e) if e.error_len().is_none() => {
                let boundary = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&bytes[..boundary]));
                bytes.drain(..boundary);
                return text;
            }
            Err(e) => {
                let skip = e.valid_up_to() + e.error_len().unwrap_or(1);
                text.push_str(&String::from_utf8_lossy(&bytes[..skip]));
                bytes.drain(..skip);
            }
        }
    }
}

/// Parse one SSE line into events; non-data lines yield nothing
fn parse_data_line(line: &str) -> Vec<LlmEvent> {
    match line.strip_prefix("data: ") {
        Some(data) => match serde_json::from_str::<Value>(data) {
            Ok(payload) => events_from_payload(&payload),
            Err(_) => Vec::new(),
        },
        None => Vec::new(),
    }
}

/// Translate one streamed Gemini payload into events.
///
/// A candidate that produced no text and finished for anything other
/// than a normal stop had its content withheld (SAFETY, RECITATION,
/// PROHIBITED_CONTENT, ...), whether `parts` is absent or just empty.
/// The prompt itself being blocked arrives as
/// `promptFeedback.blockReason` with no candidates at all.
fn events_from_payload(payload: &Value) -> Vec<LlmEvent> {
    let mut events = Vec::new();

    if let Some(reason) = payload["promptFeedback"]["blockReason"].as_str() {
        events.push(LlmEvent::SafetyBlocked {
            reason: reason.to_string(),
        });
        return events;
    }

    let Some(candidates) = payload["candidates"].as_array() else {
        return events;
    };

    for candidate in candidates {
        let mut yielded_text = false;

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() {
                        events.push(LlmEvent::TextDelta(text.to_string()));
                        yielded_text = true;
                    }
                }
            }
        }

        if !yielded_text {
            if let Some(reason) = candidate["finishReason"].as_str() {
                if reason != "STOP" && reason != "MAX_TOKENS" {
                    events.push(LlmEvent::SafetyBlocked {
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    events
}
