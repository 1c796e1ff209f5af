use async_stream::stream;
use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

use crate::error::GenerationError;

/**
 * \brief 规范化后的增量文本流：每项是一个非空片段或一个流错误。
 * \details 所有 Provider 的 generate 都收敛到这一种形状，上层不再感知 SDK 差异。
 */
pub type FragmentStream =
    Pin<Box<dyn Stream<Item = crate::error::Result<String>> + Send + 'static>>;

/**
 * \brief 将片段流原样编码为未封帧的 UTF-8 字节响应体（本地 Provider 专用）。
 */
pub fn raw_body(fragments: FragmentStream) -> Body {
    Body::from_stream(fragments.map(|item| item.map(Bytes::from)))
}

/**
 * \brief 将片段流封装成 SSE 响应体。
 */
pub fn sse_body(fragments: FragmentStream) -> Body {
    Body::from_stream(sse_events(fragments))
}

/**
 * \brief SSE 封帧：每个片段一条 `data: <text>\n\n` 记录。
 * \details 源正常耗尽后追加唯一一条 `data: [DONE]\n\n`；中继被取消时直接收尾，
 *          不补终结记录也不报错（取消不是失败）；其余错误经流自身的错误通道上抛。
 *          片段内出现的字面 `\n\n` 不做转义，见 stream 测试中的段落分隔用例。
 */
pub fn sse_events(
    mut fragments: FragmentStream,
) -> impl Stream<Item = std::result::Result<Bytes, GenerationError>> + Send {
    stream! {
        loop {
            match fragments.next().await {
                Some(Ok(text)) => {
                    yield Ok(Bytes::from(format!("data: {}\n\n", text)));
                }
                Some(Err(err)) if err.is_cancelled() => {
                    return;
                }
                Some(Err(err)) => {
                    yield Err(err);
                    return;
                }
                None => {
                    yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                    return;
                }
            }
        }
    }
}

/**
 * \brief 跨分块的 UTF-8 解码器：分块边界可能切断多字节字符，残余字节留到下一块。
 */
#[derive(Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /**
     * \brief 吸收一段字节并返回目前可解码的文本。
     */
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or(""));
                    match err.error_len() {
                        // 真正的非法序列：以替换字符跳过，继续解码其余部分
                        Some(skip) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + skip);
                        }
                        // 块尾截断的多字节字符：留待下一块
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/**
 * \brief 逐行消费 SSE 响应体，把载荷拆解成 token/完成/错误三类回调。
 * \details 载荷 `[DONE]` 触发完成并立即停读。JSON 载荷若带
 *          `choices[0].delta.content` 则以其为 token；解析失败不致命，
 *          非 JSON 载荷按原文转发（自身封帧的 `data: <text>` 即属此类）。
 *          读取错误中，取消归类为干净完成；其余才走错误回调。
 *          完成与错误互斥，恰好触发其一；本层不做重试。
 */
pub async fn consume_sse<S, F, C, E>(
    mut source: S,
    mut on_token: F,
    on_complete: C,
    on_error: E,
) where
    S: Stream<Item = std::result::Result<Bytes, GenerationError>> + Unpin,
    F: FnMut(&str),
    C: FnOnce(),
    E: FnOnce(GenerationError),
{
    let mut decoder = Utf8Carry::default();
    let mut line_buf = String::new();

    while let Some(item) = source.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) if err.is_cancelled() => {
                on_complete();
                return;
            }
            Err(err) => {
                on_error(err);
                return;
            }
        };

        line_buf.push_str(&decoder.push(&chunk));
        while let Some(pos) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(payload) = line.strip_prefix("data: ") {
                if payload == "[DONE]" {
                    on_complete();
                    return;
                }
                deliver_payload(payload, &mut on_token);
            }
        }
    }

    // 源在没有 [DONE] 的情况下耗尽，仍视为完成
    on_complete();
}

fn deliver_payload<F: FnMut(&str)>(payload: &str, on_token: &mut F) {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => {
            if let Some(text) = value
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|t| t.as_str())
            {
                if !text.is_empty() {
                    on_token(text);
                }
            }
        }
        Err(_) => {
            if !payload.is_empty() {
                on_token(payload);
            }
        }
    }
}

/**
 * \brief 在字节缓冲中定位 SSE 记录分隔符（空行）。
 */
pub fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/**
 * \brief 从一个 SSE 记录块中提取 data 行载荷。
 */
pub fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let line = line.trim_start();
        if line.starts_with("data:") {
            return Some(line[5..].trim().to_string());
        }
    }
    None
}

/**
 * \brief 从 chat-completions 增量块中提取 `choices[0].delta.content`。
 * \details 空串与缺失一视同仁地跳过，绝不产出空片段。
 */
pub fn parse_chat_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
