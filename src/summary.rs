//! End-of-call transcript summary over the OpenAI chat completions REST API.

use crate::call::TranscriptTurn;
use crate::config::Settings;
use crate::error::AppError;

use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Serialize, Deserialize, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Default)]
pub struct ChatPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

pub async fn summarize_transcript(
    http: &reqwest::Client,
    settings: &Settings,
    transcript: &[TranscriptTurn],
) -> Result<String, AppError> {
    let dialogue = transcript
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.text))
        .collect::<Vec<String>>()
        .join("\n");
    let payload = ChatPayload {
        model: settings.summary_model.clone(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: "あなたは通話記録を整理する編集者です。".to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: format!(
                    "次の電話のやり取りを50字以内で要約してください。\n\n{dialogue}"
                ),
            },
        ],
        max_tokens: Some(200),
    };

    let url = "https://api.openai.com/v1/chat/completions";
    let key = settings.openai_api_key.as_str();
    let resp = http
        .post(url)
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            error!(error=%e, "failed to send summary request");
            AppError("summary request failed")
        })?;
    let resp = resp.json::<ChatResponse>().await.map_err(|e| {
        error!(error=%e, "failed to deserialize summary response");
        AppError("summary response deserialize error")
    })?;
    resp.choices
        .first()
        .map(|c| c.message.content.trim().to_string())
        .ok_or(AppError("summary response had no choices"))
}
