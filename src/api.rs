use crate::models::{Message, Role, Settings};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

// Trait defining the interface for the remote model
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Sends one non-streaming request and returns the generated text.
    /// Any failure, transport or remote, comes back as a single error.
    async fn send_chat_request(
        &self,
        settings: &Settings,
        api_key: &str,
        system_instruction: &str,
        messages: &[Message],
    ) -> Result<String>;
}

// --- Gemini generateContent Implementation ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
}

#[derive(Serialize, Debug)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<Content>,
}

/// Maps the internal role vocabulary onto the endpoint's.
fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn build_request(system_instruction: &str, messages: &[Message]) -> GenerateContentRequest {
    let system_instruction = (!system_instruction.trim().is_empty()).then(|| SystemInstruction {
        parts: vec![Part {
            text: Some(system_instruction.to_string()),
        }],
    });

    let contents = messages
        .iter()
        .map(|msg| Content {
            role: gemini_role(msg.role).to_string(),
            parts: vec![Part {
                text: Some(msg.content.clone()),
            }],
        })
        .collect();

    GenerateContentRequest {
        system_instruction,
        contents,
    }
}

fn extract_text(response: GenerateContentResponse) -> Result<String> {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .and_then(|part| part.text)
        .context("Response is missing candidates[0].content.parts[0].text")
}

pub struct GeminiProvider {
    client: Client,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMApiProvider for GeminiProvider {
    async fn send_chat_request(
        &self,
        settings: &Settings,
        api_key: &str,
        system_instruction: &str,
        messages: &[Message],
    ) -> Result<String> {
        let request_url = format!(
            "{}/{}:generateContent",
            settings.api_base.trim_end_matches('/'),
            settings.model.trim()
        );
        log::info!(
            "Sending request to {} with {} turns",
            request_url,
            messages.len()
        );

        let request_body = build_request(system_instruction, messages);

        let response = self
            .client
            .post(&request_url)
            .query(&[("key", api_key)])
            .json(&request_body)
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Gemini API request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "API request failed with status {}: {}",
                status,
                error_body
            ));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response body")?;

        extract_text(parsed)
    }
}
