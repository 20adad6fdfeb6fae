//! Scripted provider for tests

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use super::{ChatRequest, LlmProvider, ProviderError, ProviderFactory, TextStream};
use crate::config::RunConfig;

pub enum Step {
    /// Stream this text in small pieces
    Reply(String),
    /// Fail before streaming with this HTTP status
    Status(u16),
    /// Stream the text, then break mid-stream
    Broken(String),
    /// Stream the text, then never finish
    Hang(String),
}

#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn replies(replies: &[&str]) -> Arc<Self> {
        Self::new(replies.iter().map(|r| Step::Reply(r.to_string())).collect())
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

fn pieces(text: &str) -> Vec<Result<String, ProviderError>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(7)
        .map(|c| Ok(c.iter().collect::<String>()))
        .collect()
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream(&self, request: ChatRequest) -> Result<TextStream, ProviderError> {
        self.requests.lock().push(request);
        let step = self
            .steps
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::Config("script exhausted".into()))?;
        match step {
            Step::Reply(text) => Ok(Box::pin(stream::iter(pieces(&text)))),
            Step::Status(status) => Err(ProviderError::Http {
                status,
                body: "scripted failure".into(),
            }),
            Step::Broken(text) => {
                let mut items = pieces(&text);
                items.push(Err(ProviderError::Stream("connection reset".into())));
                Ok(Box::pin(stream::iter(items)))
            }
            Step::Hang(text) => Ok(Box::pin(
                stream::iter(pieces(&text)).chain(stream::pending()),
            )),
        }
    }
}

pub struct ScriptedFactory(pub Arc<ScriptedProvider>);

impl ProviderFactory for ScriptedFactory {
    fn create(&self, _config: &RunConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(self.0.clone())
    }
}
