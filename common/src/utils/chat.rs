use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};

use crate::{
    error::AppError,
    storage::types::model::{AiModel, ModelKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub thinking: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<ChatUsage>,
}

/// One streamed fragment; exactly one item per stream carries `done = true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDelta {
    pub content: String,
    pub done: bool,
}

pub type ChatDeltaStream = BoxStream<'static, Result<ChatDelta, AppError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatDeltaStream, AppError>;
}

/// Chat client for OpenAI-compatible endpoints, remote or local.
pub struct OpenAiCompatChat {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatChat {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_base(base_url);
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        Self {
            client: Client::with_config(config),
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.map(str::to_owned),
            model: model.to_owned(),
        }
    }

    pub fn from_model(model: &AiModel) -> Result<Self, AppError> {
        if !matches!(model.kind, ModelKind::Chat | ModelKind::Vlm) {
            return Err(AppError::Validation(format!(
                "model '{}' is not a chat model",
                model.id
            )));
        }
        Ok(Self::new(
            &model.base_url,
            model.api_key.as_deref(),
            &model.name,
        ))
    }

    fn is_qwen3_family(&self) -> bool {
        self.model.to_ascii_lowercase().contains("qwen3")
    }

    /// qwen3 on compatible endpoints needs `enable_thinking=false` on
    /// non-stream calls; the typed request has no such field, so this path
    /// posts the JSON body directly.
    async fn chat_raw_with_thinking_disabled(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError> {
        #[derive(Deserialize)]
        struct RawChoiceMessage {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct RawChoice {
            message: RawChoiceMessage,
        }
        #[derive(Deserialize)]
        struct RawChatResponse {
            choices: Vec<RawChoice>,
            usage: Option<ChatUsage>,
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|message| json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                }))
                .collect::<Vec<Value>>(),
            "enable_thinking": false,
        });
        apply_raw_options(&mut body, options);

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_client_error() {
            return Err(AppError::Auth(format!(
                "chat endpoint rejected the request with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "chat endpoint returned status {status}"
            )));
        }

        let parsed: RawChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Upstream("no content in chat response".into()))?;

        Ok(ChatResponse {
            content,
            usage: parsed.usage,
        })
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, AppError> {
        let request_messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, AppError>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(request_messages);
        if stream {
            builder.stream(true);
        }
        if let Some(value) = options.temperature {
            builder.temperature(value);
        }
        if let Some(value) = options.top_p {
            builder.top_p(value);
        }
        if let Some(value) = options.max_tokens {
            builder.max_tokens(value);
        }
        if let Some(value) = options.max_completion_tokens {
            builder.max_completion_tokens(value);
        }
        if let Some(value) = options.frequency_penalty {
            builder.frequency_penalty(value);
        }
        if let Some(value) = options.presence_penalty {
            builder.presence_penalty(value);
        }

        Ok(builder.build()?)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError> {
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);

        if self.is_qwen3_family() {
            return RetryIf::spawn(
                strategy,
                || self.chat_raw_with_thinking_disabled(messages, options),
                AppError::is_transient,
            )
            .await;
        }

        let request = self.build_request(messages, options, false)?;
        let response = RetryIf::spawn(
            strategy,
            || async {
                self.client
                    .chat()
                    .create(request.clone())
                    .await
                    .map_err(AppError::from)
            },
            AppError::is_transient,
        )
        .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Upstream("no content in chat response".into()))?;

        let usage = response.usage.map(|usage| ChatUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });

        Ok(ChatResponse { content, usage })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatDeltaStream, AppError> {
        let request = self.build_request(messages, options, true)?;
        let mut upstream = self.client.chat().create_stream(request).await?;

        let stream = async_stream::stream! {
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(response) => {
                        let content = response
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.clone())
                            .unwrap_or_default();
                        if !content.is_empty() {
                            yield Ok(ChatDelta { content, done: false });
                        }
                    }
                    Err(err) => {
                        yield Err(AppError::from(err));
                        return;
                    }
                }
            }
            yield Ok(ChatDelta { content: String::new(), done: true });
        };

        Ok(stream.boxed())
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, AppError> {
    let request_message = match message.role {
        ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
    };
    Ok(request_message)
}

fn apply_raw_options(body: &mut Value, options: &ChatOptions) {
    let Some(object) = body.as_object_mut() else {
        return;
    };
    if let Some(value) = options.temperature {
        object.insert("temperature".into(), json!(value));
    }
    if let Some(value) = options.top_p {
        object.insert("top_p".into(), json!(value));
    }
    if let Some(value) = options.max_tokens {
        object.insert("max_tokens".into(), json!(value));
    }
    if let Some(value) = options.max_completion_tokens {
        object.insert("max_completion_tokens".into(), json!(value));
    }
    if let Some(value) = options.frequency_penalty {
        object.insert("frequency_penalty".into(), json!(value));
    }
    if let Some(value) = options.presence_penalty {
        object.insert("presence_penalty".into(), json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qwen3_detection_is_case_insensitive() {
        let qwen = OpenAiCompatChat::new("https://example.com/v1", None, "Qwen3-8B-Instruct");
        assert!(qwen.is_qwen3_family());

        let other = OpenAiCompatChat::new("https://example.com/v1", None, "gpt-4o-mini");
        assert!(!other.is_qwen3_family());
    }

    #[test]
    fn raw_options_are_merged_into_body() {
        let mut body = json!({ "model": "qwen3", "enable_thinking": false });
        let options = ChatOptions {
            temperature: Some(0.2),
            max_tokens: Some(256),
            ..ChatOptions::default()
        };
        apply_raw_options(&mut body, &options);

        assert_eq!(body["temperature"], json!(0.2));
        assert_eq!(body["max_tokens"], json!(256));
        assert_eq!(body["enable_thinking"], json!(false));
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
    }
}
