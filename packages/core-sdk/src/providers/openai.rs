use std::sync::Mutex;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::db::DEFAULT_LOCAL_API_URL;
use crate::error::{GenerationError, Result};
use crate::models::{Message, Model, ProviderKind};
use crate::stream::{extract_data_line, find_double_newline, parse_chat_delta, FragmentStream};

use super::AiProvider;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

struct ClientState {
    base_url: String,
    api_key: Option<String>,
    initialized: bool,
}

/**
 * \brief chat-completions 一族的 Provider：本地服务、OpenAI、OpenRouter 共用
 *        同一种报文形状，仅在鉴权、基地址与目录过滤上有差异。
 */
pub struct ChatCompletionsProvider {
    kind: ProviderKind,
    http: reqwest::Client,
    state: Mutex<ClientState>,
}

impl ChatCompletionsProvider {
    fn new(kind: ProviderKind, base_url: &str, initialized: bool) -> ChatCompletionsProvider {
        ChatCompletionsProvider {
            kind,
            http: reqwest::Client::new(),
            state: Mutex::new(ClientState {
                base_url: base_url.to_string(),
                api_key: None,
                initialized,
            }),
        }
    }

    /** \brief 本地推理服务：无需凭据，开箱即用。 */
    pub fn local() -> ChatCompletionsProvider {
        ChatCompletionsProvider::new(ProviderKind::Local, DEFAULT_LOCAL_API_URL, true)
    }

    pub fn openai() -> ChatCompletionsProvider {
        ChatCompletionsProvider::new(ProviderKind::OpenAi, OPENAI_API_BASE, false)
    }

    pub fn openrouter() -> ChatCompletionsProvider {
        ChatCompletionsProvider::new(ProviderKind::OpenRouter, OPENROUTER_API_BASE, false)
    }

    fn snapshot(&self) -> Result<(String, Option<String>)> {
        let state = self
            .state
            .lock()
            .expect("lock chat-completions client state");
        if !state.initialized {
            return Err(GenerationError::Configuration(self.kind));
        }
        Ok((state.base_url.clone(), state.api_key.clone()))
    }
}

/**
 * \brief 这些模型 ID 的线上接口会拒绝 max_tokens 参数，必须省略。
 */
fn omits_max_tokens(model_id: &str) -> bool {
    model_id.starts_with("gpt-5") || model_id.starts_with("o1") || model_id.starts_with("o3")
}

/**
 * \brief 组装 chat-completions 请求体。
 */
fn build_chat_body(
    model_id: &str,
    messages: &[Message],
    temperature: f32,
    max_tokens: u32,
) -> Value {
    let mut body = json!({
        "model": model_id,
        "messages": messages,
        "temperature": temperature,
        "stream": true,
    });
    if !omits_max_tokens(model_id) {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

/**
 * \brief OpenAI 的目录接口不报上下文长度，按 ID 片段查启发表。
 */
fn openai_context_length(model_id: &str) -> u32 {
    if model_id.contains("gpt-4") {
        8192
    } else if model_id.contains("gpt-3.5-turbo-16k") {
        16384
    } else if model_id.contains("gpt-3.5") {
        4096
    } else {
        4096
    }
}

/**
 * \brief 把 /models 的返回解析为目录条目，按 Provider 规则过滤。
 * \details 本地与 OpenRouter 信任后端（不过滤，上下文按报告值）；
 *          OpenAI 只收 ID 以 "gpt" 开头的条目并按启发表定上下文。
 */
fn models_from_catalog(kind: ProviderKind, payload: &Value) -> Vec<Model> {
    let Some(items) = payload.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|s| s.as_str())?;
            if kind == ProviderKind::OpenAi && !id.starts_with("gpt") {
                return None;
            }
            let context_length = match kind {
                ProviderKind::OpenAi => openai_context_length(id),
                _ => item
                    .get("context_length")
                    .and_then(|c| c.as_u64())
                    .map(|c| c as u32)
                    .unwrap_or(4096),
            };
            let name = item
                .get("name")
                .and_then(|s| s.as_str())
                .unwrap_or(id)
                .to_string();
            Some(Model {
                id: id.to_string(),
                name,
                provider: kind,
                context_length,
                enabled: true,
            })
        })
        .collect()
}

#[async_trait]
impl AiProvider for ChatCompletionsProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn initialize(&self, credential: Option<&str>) {
        let Some(credential) = credential else {
            return;
        };
        let mut state = self
            .state
            .lock()
            .expect("lock chat-completions client state");
        if self.kind == ProviderKind::Local {
            state.base_url = credential.trim_end_matches('/').to_string();
        } else {
            state.api_key = Some(credential.to_string());
        }
        state.initialized = true;
    }

    fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .expect("lock chat-completions client state")
            .initialized
    }

    async fn try_fetch_models(&self) -> Result<Vec<Model>> {
        let (base, key) = self.snapshot()?;
        let mut request = self.http.get(format!("{}/models", base.trim_end_matches('/')));
        if let Some(key) = &key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| GenerationError::discovery(self.kind, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::discovery(
                self.kind,
                format!("list models failed: {} -> {}", status, text),
            ));
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::discovery(self.kind, e))?;
        Ok(models_from_catalog(self.kind, &payload))
    }

    async fn generate(
        &self,
        messages: &[Message],
        model_id: &str,
        temperature: f32,
        max_tokens: u32,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let (base, key) = self.snapshot()?;
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let body = build_chat_body(model_id, messages, temperature, max_tokens);

        let mut request = self.http.post(url).json(&body);
        if let Some(key) = &key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key));
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            resp = request.send() => resp?,
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Transport(format!(
                "request failed: {} -> {}",
                status, text
            )));
        }

        let mut source = resp.bytes_stream();
        let out = stream! {
            let mut buf = Vec::<u8>::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        yield Err(GenerationError::Cancelled);
                        return;
                    }
                    next = source.next() => match next {
                        None => break,
                        Some(Ok(chunk)) => chunk,
                        Some(Err(err)) => {
                            yield Err(err.into());
                            return;
                        }
                    },
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = find_double_newline(&buf) {
                    let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                    if let Some(line) = extract_data_line(&block) {
                        if line.trim() == "[DONE]" {
                            return;
                        }
                        if let Some(delta) = parse_chat_delta(&line) {
                            yield Ok(delta);
                        }
                    }
                }
            }
            // 上游没发 [DONE] 就断开时，缓冲里可能还剩最后一个块
            if !buf.is_empty() {
                if let Some(line) = extract_data_line(&buf) {
                    if line.trim() != "[DONE]" {
                        if let Some(delta) = parse_chat_delta(&line) {
                            yield Ok(delta);
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}
