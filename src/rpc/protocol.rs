//! Worker 线协议：按行分隔的 JSON 请求 / 响应信封
//!
//! 请求：`{"id": 1, "method": "tools/call", "params": {"name": "...", "arguments": {...}}}`
//! 响应：`{"id": 1, "result": ...}` 或 `{"id": 1, "error": {"message": "..."}}`
//!
//! id 只在同一代 Worker 进程内唯一，跨重启不可关联。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::RpcError;

pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// 工具调用参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// 请求信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: ToolCallParams,
}

impl RpcRequest {
    pub fn tool_call(id: u64, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id,
            method: TOOLS_CALL_METHOD.to_string(),
            params: ToolCallParams {
                name: name.into(),
                arguments,
            },
        }
    }

    /// 序列化为一行（含结尾换行）
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// 响应中的错误体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// 响应信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcErrorBody {
                message: message.into(),
                code: None,
            }),
        }
    }

    /// 文本结果：`{"content": [{"type": "text", "text": ...}]}`
    pub fn text(id: u64, text: impl Into<String>) -> Self {
        Self::success(
            id,
            serde_json::json!({ "content": [{ "type": "text", "text": text.into() }] }),
        )
    }

    /// 转换为调用结果；文本负载会尝试解析为 JSON
    pub fn into_result(self, tool: &str) -> Result<Value, RpcError> {
        if let Some(err) = self.error {
            return Err(RpcError::Remote {
                tool: tool.to_string(),
                message: err.message,
            });
        }
        match self.result {
            Some(result) => extract_payload(result).map_err(|message| RpcError::Remote {
                tool: tool.to_string(),
                message,
            }),
            None => Ok(Value::Null),
        }
    }
}

/// 解析一行 Worker 输出；不是响应信封时返回 None（视为诊断噪声）
pub fn parse_response(line: &str) -> Option<RpcResponse> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// 从 result 中取出首个 text 内容并尝试解析为 JSON，失败则保留原文本；
/// `isError: true` 时返回 Err(文本)。不是 content 形态的 result 原样返回。
pub fn extract_payload(result: Value) -> Result<Value, String> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        })
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);

    match text {
        Some(text) if is_error => Err(text),
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        None if is_error => Err("Tool reported an error without details".to_string()),
        None => Ok(result),
    }
}

/// 按换行切分字节流，保留未完成的尾行到下一次读取
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段数据，返回其中所有完整的非空行
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// 未完成部分的字节数
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_shape() {
        let line = RpcRequest::tool_call(7, "echo", json!({"a": 1})).to_line().unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(
            v,
            json!({"id": 7, "method": "tools/call", "params": {"name": "echo", "arguments": {"a": 1}}})
        );
    }

    #[test]
    fn test_line_buffer_keeps_partial_line() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"id\":1,").is_empty());
        assert_eq!(buf.pending_len(), 8);
        let lines = buf.push(b"\"result\":null}\n{\"id\":2");
        assert_eq!(lines, vec!["{\"id\":1,\"result\":null}".to_string()]);
        let lines = buf.push(b",\"result\":1}\r\n\n");
        assert_eq!(lines, vec!["{\"id\":2,\"result\":1}".to_string()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_parse_response_ignores_noise() {
        assert!(parse_response("worker booting...").is_none());
        assert!(parse_response("{not json").is_none());
        assert!(parse_response("{\"method\":\"log\"}").is_none());
        let r = parse_response("{\"id\":3,\"error\":{\"message\":\"nope\"}}").unwrap();
        assert_eq!(r.id, 3);
        assert_eq!(r.error.unwrap().message, "nope");
    }

    #[test]
    fn test_text_payload_parsed_as_json() {
        let r = RpcResponse::text(1, "{\"ok\":true}");
        assert_eq!(r.into_result("t").unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_text_payload_falls_back_to_string() {
        let r = RpcResponse::text(1, "plain words");
        assert_eq!(r.into_result("t").unwrap(), json!("plain words"));
    }

    #[test]
    fn test_structured_result_returned_as_is() {
        let r = RpcResponse::success(1, json!({"rows": [1, 2]}));
        assert_eq!(r.into_result("t").unwrap(), json!({"rows": [1, 2]}));
    }

    #[test]
    fn test_is_error_payload() {
        let r = RpcResponse::success(
            1,
            json!({"isError": true, "content": [{"type": "text", "text": "bad input"}]}),
        );
        match r.into_result("lint") {
            Err(RpcError::Remote { tool, message }) => {
                assert_eq!(tool, "lint");
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
