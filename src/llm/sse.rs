//! OpenAI-compatible SSE chat-completions delta parsing
//!
//! Assistant text, thinking content, and tool-call fragments interleave
//! across SSE chunks. The parser keys tool-call accumulators by the delta
//! index, extracts thinking from either a dedicated reasoning field or
//! inline `<thinking>` tags, and captures usage from the final chunk.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::llm::types::{LlmError, ToolCall, UsageData};

const THINK_OPEN: &str = "<thinking>";
const THINK_CLOSE: &str = "</thinking>";

/// One parsed delta ready for emission as a stream chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseDelta {
    Content(String),
    Thinking { text: String, encrypted: bool },
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful parser for one streaming response
#[derive(Debug, Default)]
pub struct SseParser {
    tool_calls: BTreeMap<u64, PartialToolCall>,
    usage: Option<UsageData>,
    finish_reason: Option<String>,
    extractor: ThinkingExtractor,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one SSE `data:` payload (the caller filters `[DONE]`)
    pub fn feed(&mut self, data: &str) -> Result<Vec<SseDelta>, LlmError> {
        let json: Value = serde_json::from_str(data).map_err(|e| LlmError::Parse {
            message: format!("bad SSE chunk: {}", e),
        })?;

        let mut deltas = Vec::new();

        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(parse_usage(usage));
        }

        let Some(choices) = json["choices"].as_array() else {
            return Ok(deltas);
        };

        for choice in choices {
            let delta = &choice["delta"];

            for key in ["reasoning", "reasoning_content"] {
                if let Some(text) = delta[key].as_str() {
                    if !text.is_empty() {
                        let encrypted = delta["reasoning_encrypted"].as_bool().unwrap_or(false);
                        deltas.push(SseDelta::Thinking {
                            text: text.to_string(),
                            encrypted,
                        });
                    }
                }
            }

            if let Some(tool_calls) = delta["tool_calls"].as_array() {
                for tc in tool_calls {
                    let index = tc["index"].as_u64().unwrap_or(0);
                    let entry = self.tool_calls.entry(index).or_default();
                    if let Some(id) = tc["id"].as_str() {
                        if !id.is_empty() {
                            entry.id = id.to_string();
                        }
                    }
                    if let Some(func) = tc["function"].as_object() {
                        if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                            if !name.is_empty() {
                                entry.name = name.to_string();
                            }
                        }
                        if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }

            if let Some(content) = delta["content"].as_str() {
                if !content.is_empty() {
                    deltas.extend(self.extractor.push(content));
                }
            }

            if let Some(reason) = choice["finish_reason"].as_str() {
                self.finish_reason = Some(reason.to_string());
            }
        }

        Ok(deltas)
    }

    /// Drain any held-back text at end of stream
    pub fn flush(&mut self) -> Vec<SseDelta> {
        self.extractor.flush()
    }

    /// Accumulated tool calls in the order the model emitted them
    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.tool_calls)
            .into_values()
            .filter(|partial| !partial.id.is_empty() || !partial.name.is_empty())
            .map(|partial| ToolCall {
                id: partial.id,
                name: partial.name,
                arguments: partial.arguments,
            })
            .collect()
    }

    pub fn usage(&self) -> Option<UsageData> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}

fn parse_usage(usage: &Value) -> UsageData {
    UsageData {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        reasoning_tokens: usage["completion_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0) as u32,
        estimated: false,
    }
}

/// Splits a content stream into text and `<thinking>` runs, holding back
/// partial tags that straddle chunk boundaries
#[derive(Debug, Default)]
struct ThinkingExtractor {
    inside: bool,
    pending: String,
}

impl ThinkingExtractor {
    fn push(&mut self, chunk: &str) -> Vec<SseDelta> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();
        loop {
            let tag = if self.inside { THINK_CLOSE } else { THINK_OPEN };
            if let Some(pos) = self.pending.find(tag) {
                let before: String = self.pending[..pos].to_string();
                self.emit(&mut out, before);
                self.pending.drain(..pos + tag.len());
                self.inside = !self.inside;
            } else {
                let keep = partial_suffix_len(&self.pending, tag);
                let emit_len = self.pending.len() - keep;
                if emit_len > 0 {
                    let text: String = self.pending.drain(..emit_len).collect();
                    self.emit(&mut out, text);
                }
                break;
            }
        }
        out
    }

    fn flush(&mut self) -> Vec<SseDelta> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.emit(&mut out, rest);
        out
    }

    fn emit(&self, out: &mut Vec<SseDelta>, text: String) {
        if text.is_empty() {
            return;
        }
        if self.inside {
            out.push(SseDelta::Thinking {
                text,
                encrypted: false,
            });
        } else {
            out.push(SseDelta::Content(text));
        }
    }
}

/// Length of the longest buffer suffix that is a proper prefix of `tag`
fn partial_suffix_len(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        let start = buffer.len() - len;
        if buffer.is_char_boundary(start) && tag.as_bytes().starts_with(&buffer.as_bytes()[start..])
        {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn content(deltas: &[SseDelta]) -> String {
        deltas
            .iter()
            .filter_map(|d| match d {
                SseDelta::Content(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn thinking(deltas: &[SseDelta]) -> String {
        deltas
            .iter()
            .filter_map(|d| match d {
                SseDelta::Thinking { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_text_delta() {
        let mut parser = SseParser::new();
        let deltas = parser
            .feed(r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"Hello!"},"index":0}]}"#)
            .unwrap();
        assert_eq!(deltas, vec![SseDelta::Content("Hello!".into())]);
        assert!(parser.take_tool_calls().is_empty());
    }

    #[test]
    fn test_tool_call_accumulates_across_chunks() {
        let mut parser = SseParser::new();
        parser.feed(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_xyz","type":"function","function":{"name":"list","arguments":""}}]},"index":0}]}"#).unwrap();
        parser.feed(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\""}}]},"index":0}]}"#).unwrap();
        parser.feed(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\".\"}"}}]},"index":0}]}"#).unwrap();

        let calls = parser.take_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_xyz");
        assert_eq!(calls[0].name, "list");
        assert_eq!(calls[0].arguments, r#"{"path":"."}"#);
    }

    #[test]
    fn test_parallel_tool_calls_keep_emission_order() {
        let mut parser = SseParser::new();
        parser.feed(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read","arguments":"{}"}},{"index":1,"id":"call_b","function":{"name":"list","arguments":"{}"}}]},"index":0}]}"#).unwrap();

        let calls = parser.take_tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn test_reasoning_field_becomes_thinking() {
        let mut parser = SseParser::new();
        let deltas = parser
            .feed(r#"{"choices":[{"delta":{"reasoning":"step 1"},"index":0}]}"#)
            .unwrap();
        assert_eq!(
            deltas,
            vec![SseDelta::Thinking {
                text: "step 1".into(),
                encrypted: false
            }]
        );

        let deltas = parser
            .feed(
                r#"{"choices":[{"delta":{"reasoning_content":"x","reasoning_encrypted":true},"index":0}]}"#,
            )
            .unwrap();
        assert_eq!(
            deltas,
            vec![SseDelta::Thinking {
                text: "x".into(),
                encrypted: true
            }]
        );
    }

    #[test]
    fn test_thinking_tags_extracted_inline() {
        let mut parser = SseParser::new();
        let deltas = parser
            .feed(r#"{"choices":[{"delta":{"content":"a<thinking>ponder</thinking>b"},"index":0}]}"#)
            .unwrap();
        assert_eq!(content(&deltas), "ab");
        assert_eq!(thinking(&deltas), "ponder");
    }

    #[test]
    fn test_thinking_tag_split_across_chunks() {
        let mut parser = SseParser::new();
        let mut all = Vec::new();
        for piece in ["before<thi", "nking>inner</thin", "king>after"] {
            let payload = serde_json::json!({
                "choices": [{"delta": {"content": piece}, "index": 0}]
            });
            all.extend(parser.feed(&payload.to_string()).unwrap());
        }
        all.extend(parser.flush());
        assert_eq!(content(&all), "beforeafter");
        assert_eq!(thinking(&all), "inner");
    }

    #[test]
    fn test_flush_releases_held_back_partial_tag() {
        let mut parser = SseParser::new();
        let mut all = parser
            .feed(r#"{"choices":[{"delta":{"content":"x<thin"},"index":0}]}"#)
            .unwrap();
        all.extend(parser.flush());
        assert_eq!(content(&all), "x<thin");
    }

    #[test]
    fn test_usage_from_final_chunk() {
        let mut parser = SseParser::new();
        parser
            .feed(r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#)
            .unwrap();
        let usage = parser.usage().unwrap();
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(usage.reasoning_tokens, 0);
        assert!(!usage.estimated);
    }

    #[test]
    fn test_usage_reasoning_detail() {
        let mut parser = SseParser::new();
        parser
            .feed(r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":20,"completion_tokens_details":{"reasoning_tokens":7}}}"#)
            .unwrap();
        assert_eq!(parser.usage().unwrap().reasoning_tokens, 7);
    }

    #[test]
    fn test_finish_reason_captured() {
        let mut parser = SseParser::new();
        parser
            .feed(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls","index":0}]}"#)
            .unwrap();
        assert_eq!(parser.finish_reason(), Some("tool_calls"));
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        let mut parser = SseParser::new();
        assert!(matches!(
            parser.feed("not json"),
            Err(LlmError::Parse { .. })
        ));
    }
}
