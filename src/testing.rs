//! Test doubles shared by the unit test modules.

use crate::api::LLMApiProvider;
use crate::models::{Message, Settings};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub api_key: String,
    pub system_instruction: String,
    pub messages: Vec<Message>,
}

type Responder = Box<dyn Fn(&[Message]) -> Result<String, String> + Send + Sync>;

/// A provider that answers from a closure and records every request.
pub struct MockProvider {
    respond: Responder,
    gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockProvider {
    pub fn from_fn(
        respond: impl Fn(&[Message]) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::from_fn(move |_| Ok(text.clone()))
    }

    pub fn failing(reason: &str) -> Self {
        let reason = reason.to_string();
        Self::from_fn(move |_| Err(reason.clone()))
    }

    /// Every call waits for a `notify_one` on the returned handle before answering.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMApiProvider for MockProvider {
    async fn send_chat_request(
        &self,
        settings: &Settings,
        api_key: &str,
        system_instruction: &str,
        messages: &[Message],
    ) -> Result<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: settings.model.clone(),
            api_key: api_key.to_string(),
            system_instruction: system_instruction.to_string(),
            messages: messages.to_vec(),
        });
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        (self.respond)(messages).map_err(|reason| anyhow::anyhow!(reason))
    }
}

pub fn test_settings() -> Settings {
    let mut settings = crate::config::default_settings();
    settings.api_key = "test-key".into();
    settings
}
