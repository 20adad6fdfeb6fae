//! OpenAI-compatible chat completions over SSE

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::{
    ChatRequest, LlmProvider, ProviderError, ProviderFactory, TextStream,
};
use crate::config::RunConfig;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn stream(&self, request: ChatRequest) -> Result<TextStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();
        debug!(model = %request.model, messages = request.messages.len(), "Opening completion stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::body(&request))
            .send()
            .await?;

        let status = response.status();
        info!("Completion response: {} in {:?}", status, started.elapsed());
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Completion request failed: {} - {}", status, body);
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sse_text_stream(response.bytes_stream().boxed()))
    }
}

/// Decodes `data:` lines of an SSE body into content deltas
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, ProviderError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = std::str::from_utf8(&line)
                .map_err(|e| ProviderError::Stream(format!("Invalid UTF-8: {}", e)))?
                .trim_end_matches(['\r', '\n']);
            if let Some(event) = Self::parse_line(line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn parse_line(line: &str) -> Result<Option<SseEvent>, ProviderError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            return Ok(Some(SseEvent::Done));
        }
        let value: Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::Stream(format!("Malformed event: {}", e)))?;
        if let Some(err) = value.get("error") {
            return Err(ProviderError::Stream(err.to_string()));
        }
        Ok(value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| SseEvent::Delta(s.to_string())))
    }
}

struct SseState {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    done: bool,
}

fn sse_text_stream(inner: BoxStream<'static, reqwest::Result<Bytes>>) -> TextStream {
    let state = SseState {
        inner,
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        done: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.ready.pop_front() {
                return Some((Ok(text), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => match state.decoder.push(&bytes) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                SseEvent::Delta(text) => state.ready.push_back(text),
                                SseEvent::Done => state.done = true,
                            }
                        }
                    }
                    Err(e) => {
                        state.done = true;
                        state.ready.clear();
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(ProviderError::Stream(e.to_string())), state));
                }
                None => state.done = true,
            }
        }
    }))
}

/// Creates an [`OpenAiProvider`] per run, sharing one HTTP client
#[derive(Clone, Default)]
pub struct OpenAiFactory {
    client: reqwest::Client,
}

impl ProviderFactory for OpenAiFactory {
    fn create(&self, config: &RunConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::Config(
                    "No API key configured. Set TANDEM_API_KEY or OPENAI_API_KEY, or send api_key with configure".into(),
                )
            })?;
        Ok(Arc::new(OpenAiProvider::new(
            self.client.clone(),
            &config.base_url,
            api_key,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ChatRole};

    #[test]
    fn test_decoder_splits_across_chunks() {
        let mut decoder = SseDecoder::default();
        let first = decoder
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel")
            .unwrap();
        assert!(first.is_empty());
        let rest = decoder
            .push(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{}}]}\n\ndata: [DONE]\n\n")
            .unwrap();
        assert_eq!(rest, vec![SseEvent::Delta("Hello".into()), SseEvent::Done]);
    }

    #[test]
    fn test_decoder_multibyte_split() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n".as_bytes();
        let split = line.iter().position(|b| *b > 127).unwrap() + 1;
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&line[..split]).unwrap().is_empty());
        assert_eq!(
            decoder.push(&line[split..]).unwrap(),
            vec![SseEvent::Delta("é".into())]
        );
    }

    #[test]
    fn test_decoder_reports_errors() {
        let mut decoder = SseDecoder::default();
        let err = decoder
            .push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
        assert!(decoder.push(b": keep-alive\n").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_stream_stops_at_done() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n")),
        ];
        let texts: Vec<String> = sse_text_stream(stream::iter(chunks).boxed())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_request_body() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::new(ChatRole::User, "hi")],
            temperature: Some(0.5),
        };
        let body = OpenAiProvider::body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["temperature"], 0.5);
    }

    #[test]
    fn test_factory_requires_key() {
        let factory = OpenAiFactory::default();
        assert!(matches!(
            factory.create(&RunConfig::default()),
            Err(ProviderError::Config(_))
        ));
        let config = RunConfig {
            api_key: Some("sk-test".into()),
            ..RunConfig::default()
        };
        assert!(factory.create(&config).is_ok());
    }
}
