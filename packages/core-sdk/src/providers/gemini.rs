use std::sync::Mutex;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{GenerationError, Result};
use crate::models::{Message, Model, ProviderKind};
use crate::stream::{extract_data_line, find_double_newline, FragmentStream};

use super::AiProvider;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_CONTEXT: u32 = 32768;

/**
 * \brief Google Gemini Provider。
 * \details 流式接口按整响应对象逐块迭代，与 chat-completions 的 delta 形状不同；
 *          本实现把每块的文本抽出来，收敛到同一份片段流契约。
 */
pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: Mutex<Option<String>>,
}

impl GeminiProvider {
    pub fn new() -> GeminiProvider {
        GeminiProvider {
            http: reqwest::Client::new(),
            api_key: Mutex::new(None),
        }
    }

    fn key(&self) -> Result<String> {
        self.api_key
            .lock()
            .expect("lock gemini api key")
            .clone()
            .ok_or(GenerationError::Configuration(ProviderKind::Gemini))
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        GeminiProvider::new()
    }
}

/**
 * \brief 组装 generateContent 请求体。
 * \details 只有 `gemini-` 前缀的模型接受原生 systemInstruction 字段；
 *          其余模型把全部 system 消息（按出现顺序换行拼接）加空行前置到第一条
 *          user 消息的文本里，并且不发送 systemInstruction。两条路径下多条
 *          system 消息的拼接顺序一致。
 */
fn build_request(
    model_id: &str,
    messages: &[Message],
    temperature: f32,
    max_tokens: u32,
) -> Value {
    let system_parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let system_text = system_parts.join("\n");
    let native_system = model_id.starts_with("gemini-");

    let mut contents = Vec::new();
    let mut prepend_pending = !native_system && !system_text.is_empty();
    for message in messages {
        match message.role.as_str() {
            "system" => continue,
            "assistant" => contents.push(json!({
                "role": "model",
                "parts": [{"text": message.content}]
            })),
            _ => {
                let text = if prepend_pending {
                    prepend_pending = false;
                    format!("{}\n\n{}", system_text, message.content)
                } else {
                    message.content.clone()
                };
                contents.push(json!({
                    "role": "user",
                    "parts": [{"text": text}]
                }));
            }
        }
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": temperature,
            "maxOutputTokens": max_tokens,
        },
    });
    if native_system && !system_text.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{"text": system_text}]
        });
    }
    body
}

/**
 * \brief 从一个流式响应块中取出文本；候选的全部 part 拼接，空块跳过。
 */
fn chunk_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/**
 * \brief 解析模型目录：只收支持 generateContent 的条目。
 */
fn models_from_catalog(payload: &Value) -> Vec<Model> {
    let Some(items) = payload.get("models").and_then(|m| m.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let methods = item
                .get("supportedGenerationMethods")
                .and_then(|m| m.as_array())?;
            if !methods.iter().any(|m| m.as_str() == Some("generateContent")) {
                return None;
            }
            let name = item.get("name").and_then(|s| s.as_str())?;
            let id = name.strip_prefix("models/").unwrap_or(name).to_string();
            let display = item
                .get("displayName")
                .and_then(|s| s.as_str())
                .unwrap_or(&id)
                .to_string();
            let context_length = item
                .get("inputTokenLimit")
                .and_then(|c| c.as_u64())
                .map(|c| c as u32)
                .unwrap_or(GEMINI_DEFAULT_CONTEXT);
            Some(Model {
                id,
                name: display,
                provider: ProviderKind::Gemini,
                context_length,
                enabled: true,
            })
        })
        .collect()
}

#[async_trait]
impl AiProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn initialize(&self, credential: Option<&str>) {
        let Some(credential) = credential else {
            return;
        };
        let mut key = self.api_key.lock().expect("lock gemini api key");
        *key = Some(credential.to_string());
    }

    fn is_initialized(&self) -> bool {
        self.api_key.lock().expect("lock gemini api key").is_some()
    }

    async fn try_fetch_models(&self) -> Result<Vec<Model>> {
        let key = self
            .key()
            .map_err(|_| GenerationError::discovery(ProviderKind::Gemini, "missing api key"))?;
        let resp = self
            .http
            .get(format!("{}/models", GEMINI_API_BASE))
            .query(&[("key", key.as_str())])
            .send()
            .await
            .map_err(|e| GenerationError::discovery(ProviderKind::Gemini, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::discovery(
                ProviderKind::Gemini,
                format!("list models failed: {} -> {}", status, text),
            ));
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::discovery(ProviderKind::Gemini, e))?;
        Ok(models_from_catalog(&payload))
    }

    async fn generate(
        &self,
        messages: &[Message],
        model_id: &str,
        temperature: f32,
        max_tokens: u32,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let key = self.key()?;
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            GEMINI_API_BASE, model_id
        );
        let body = build_request(model_id, messages, temperature, max_tokens);

        let request = self
            .http
            .post(url)
            .query(&[("alt", "sse"), ("key", key.as_str())])
            .json(&body);

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            resp = request.send() => resp?,
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Transport(format!(
                "gemini request failed: {} -> {}",
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
                        if let Ok(value) = serde_json::from_str::<Value>(&line) {
                            if let Some(text) = chunk_text(&value) {
                                yield Ok(text);
                            }
                        }
                    }
                }
            }
            if !buf.is_empty() {
                if let Some(line) = extract_data_line(&buf) {
                    if let Ok(value) = serde_json::from_str::<Value>(&line) {
                        if let Some(text) = chunk_text(&value) {
                            yield Ok(text);
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}
