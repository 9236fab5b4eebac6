//! Streaming chat-completions client (OpenAI-compatible wire)

use eventsource_stream::{Event, EventStream, Eventsource};
use futures::Stream;
use serde_json::json;

use crate::channels::ChatRequest;
use crate::llm::types::{ChatMessage, LlmError, MessageRole};

/// Open a streaming chat-completions request and return the SSE event stream
pub async fn open_stream(
    http: &reqwest::Client,
    request: &ChatRequest,
) -> Result<
    EventStream<impl Stream<Item = reqwest::Result<bytes::Bytes>>>,
    LlmError,
> {
    let url = format!(
        "{}/chat/completions",
        request.base_url.trim_end_matches('/')
    );
    let body = build_request_body(request);

    let response = http
        .post(&url)
        .bearer_auth(&request.api_key)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| LlmError::Network {
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(parse_error_response(status.as_u16(), &text));
    }

    Ok(response.bytes_stream().eventsource())
}

/// True for stream elements carrying a JSON payload (filters `[DONE]`)
pub fn is_data_event(event: &Event) -> bool {
    event.data != "[DONE]"
}

pub fn build_request_body(request: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request.messages.iter().map(wire_message).collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
        "stream_options": {"include_usage": true},
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });

    if request.enable_tools && !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn wire_message(message: &ChatMessage) -> serde_json::Value {
    match message.role {
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        MessageRole::Assistant if !message.tool_calls.is_empty() => {
            let tool_calls: Vec<serde_json::Value> = message
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                serde_json::Value::Null
            } else {
                json!(message.content)
            };
            json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            })
        }
        role => json!({
            "role": role.as_str(),
            "content": message.content,
        }),
    }
}

fn parse_error_response(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| json["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    match status {
        401 | 403 => LlmError::Auth { message },
        429 => LlmError::RateLimit { message },
        400..=499 => LlmError::InvalidRequest { message },
        _ => LlmError::Provider { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ToolCall, ToolDefinition};
    use std::time::Duration;

    fn request_with(messages: Vec<ChatMessage>, tools: Vec<ToolDefinition>) -> ChatRequest {
        ChatRequest {
            request_id: "req-1".into(),
            messages,
            model: "gpt-4o".into(),
            model_nickname: "gpt4o".into(),
            max_tokens: 1024,
            temperature: 0.7,
            base_url: "https://api.openai.com/v1".into(),
            api_key: "sk-test".into(),
            enable_tools: !tools.is_empty(),
            tools,
            agent_name: None,
            conversation_id: None,
            tool_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_body_includes_stream_options() {
        let req = request_with(vec![ChatMessage::user("hi")], vec![]);
        let body = build_request_body(&req);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_assistant_tool_calls_serialized() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls = vec![ToolCall {
            id: "call_1".into(),
            name: "list".into(),
            arguments: r#"{"path":"."}"#.into(),
        }];
        let req = request_with(
            vec![ChatMessage::user("ls"), assistant, ChatMessage::tool_result("call_1", "{}")],
            vec![],
        );
        let body = build_request_body(&req);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[1]["role"], "assistant");
        assert!(messages[1]["content"].is_null());
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["arguments"],
            r#"{"path":"."}"#
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_tools_array_shape() {
        let tools = vec![ToolDefinition {
            name: "read".into(),
            description: "Read a file".into(),
            input_schema: serde_json::json!({"type":"object"}),
        }];
        let req = request_with(vec![ChatMessage::user("x")], tools);
        let body = build_request_body(&req);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "read");
    }

    #[test]
    fn test_error_response_mapping() {
        let err = parse_error_response(401, r#"{"error":{"message":"bad key"}}"#);
        assert!(matches!(err, LlmError::Auth { .. }));

        let err = parse_error_response(429, "slow down");
        assert!(matches!(err, LlmError::RateLimit { .. }));

        let err = parse_error_response(400, r#"{"error":{"message":"bad arg"}}"#);
        assert!(matches!(err, LlmError::InvalidRequest { .. }));

        let err = parse_error_response(503, "unavailable");
        assert!(matches!(err, LlmError::Provider { status: 503, .. }));
    }
}
