//! Stream Frame Parser
//!
//! Decodes SSE text into [`StreamFrame`]s. [`parse_chunk`] is stateless: the
//! caller owns a [`FrameCarry`] that holds back any unterminated trailing
//! fragment until the rest of the frame arrives.

use crate::constants::{DONE_SENTINEL, MAX_CARRY_BYTES};
use crate::types::{StreamFrame, UsageInfo};
use serde::Deserialize;
use std::borrow::Cow;

/// Frames decoded from one chunk, plus how many payloads were dropped as malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedChunk {
    pub frames: Vec<StreamFrame>,
    pub dropped: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    usage: Option<UsageInfo>,
    #[serde(default, alias = "finish_reason")]
    finish_reason: Option<String>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireError {
    Detailed { message: String },
    Plain(String),
    Other(serde_json::Value),
}

impl WireError {
    fn into_message(self) -> String {
        match self {
            Self::Detailed { message } | Self::Plain(message) => message,
            Self::Other(v) => v.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

pub fn parse_chunk(text: &str) -> Vec<StreamFrame> {
    parse_chunk_with_stats(text).frames
}

pub fn parse_chunk_with_stats(text: &str) -> ParsedChunk {
    let normalized: Cow<'_, str> = if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(text)
    };

    let mut parsed = ParsedChunk::default();
    for block in normalized.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        parse_frame(block, &mut parsed);
    }
    parsed
}

fn is_heartbeat(line: &str) -> bool {
    line.strip_prefix(':')
        .map(|rest| rest.trim_start().starts_with("heartbeat"))
        .unwrap_or(false)
}

fn parse_frame(block: &str, parsed: &mut ParsedChunk) {
    for line in block.lines().filter(|l| !l.trim().is_empty()) {
        if is_heartbeat(line) {
            tracing::trace!("[☁️  -> 🖥️ ] heartbeat");
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        let Some(rest) = line.strip_prefix("data:") else {
            // event:, id:, retry: carry nothing we use
            continue;
        };
        let data = rest.trim();
        if data == DONE_SENTINEL {
            parsed.frames.push(StreamFrame::Done);
            continue;
        }
        parse_payload(data, parsed);
    }
}

fn parse_payload(data: &str, parsed: &mut ParsedChunk) {
    let payload = match serde_json::from_str::<WirePayload>(data) {
        Ok(p) => p,
        Err(e) => {
            parsed.dropped += 1;
            tracing::warn!(
                "[☁️  -> 🖥️ ] Dropping malformed frame ({}): {}",
                e,
                snippet(data, 120)
            );
            return;
        }
    };

    if let Some(err) = payload.error {
        parsed.frames.push(StreamFrame::ServerError {
            message: err.into_message(),
        });
        return;
    }

    let first_choice = payload.choices.into_iter().next();
    let (choice_content, choice_finish) = match first_choice {
        Some(c) => (c.delta.and_then(|d| d.content), c.finish_reason),
        None => (None, None),
    };

    let content = payload.content.or(choice_content);
    if let Some(text) = content.filter(|t| !t.is_empty()) {
        parsed.frames.push(StreamFrame::ContentDelta { text });
    }

    if let Some(usage) = payload.usage {
        parsed.frames.push(StreamFrame::UsageReport {
            usage,
            finish_reason: payload.finish_reason.or(choice_finish),
        });
    }
}

fn snippet(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => Cow::Owned(format!("{}...", &s[..idx])),
        None => Cow::Borrowed(s),
    }
}

/// Holds raw bytes until a frame boundary (blank line) is seen.
///
/// Released text always ends on a frame boundary, so neither frames nor
/// multi-byte characters are ever split across parser calls.
#[derive(Debug, Default)]
pub struct FrameCarry {
    buffer: Vec<u8>,
}

impl FrameCarry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes`; returns every complete frame accumulated so far.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let boundary = self
            .buffer
            .windows(2)
            .rposition(|w| w == b"\n\n")
            .map(|pos| pos + 2);

        match boundary {
            Some(end) => {
                let rest = self.buffer.split_off(end);
                let complete = std::mem::replace(&mut self.buffer, rest);
                Some(String::from_utf8_lossy(&complete).into_owned())
            }
            None => {
                if self.buffer.len() > MAX_CARRY_BYTES {
                    tracing::warn!(
                        "[☁️  -> 🖥️ ] Unterminated frame exceeded {} bytes, releasing it early",
                        MAX_CARRY_BYTES
                    );
                    return self.finish();
                }
                None
            }
        }
    }

    /// Releases whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_usage_and_done() {
        let text = "data: {\"content\":\"Hi\"}\n\n\
                    data: {\"usage\":{\"promptTokens\":3,\"completionTokens\":2,\"totalTokens\":5},\"finishReason\":\"stop\"}\n\n\
                    data: [DONE]\n\n";
        let frames = parse_chunk(text);
        assert_eq!(
            frames,
            vec![
                StreamFrame::ContentDelta { text: "Hi".into() },
                StreamFrame::UsageReport {
                    usage: UsageInfo {
                        prompt_tokens: 3,
                        completion_tokens: 2,
                        total_tokens: 5
                    },
                    finish_reason: Some("stop".into()),
                },
                StreamFrame::Done,
            ]
        );
    }

    #[test]
    fn test_heartbeat_and_malformed_are_dropped() {
        let text = ": heartbeat\n\n:heartbeat\n\ndata: {not json\n\ndata: {\"content\":\"ok\"}\n\n";
        let parsed = parse_chunk_with_stats(text);
        assert_eq!(
            parsed.frames,
            vec![StreamFrame::ContentDelta { text: "ok".into() }]
        );
        assert_eq!(parsed.dropped, 1);
    }

    #[test]
    fn test_heartbeat_line_does_not_swallow_its_block() {
        let frames = parse_chunk(": heartbeat\ndata: {\"content\":\"Hi\"}\n\ndata: [DONE]\n\n");
        assert_eq!(
            frames,
            vec![StreamFrame::ContentDelta { text: "Hi".into() }, StreamFrame::Done]
        );
    }

    #[test]
    fn test_error_payload_yields_server_error_only() {
        let frames =
            parse_chunk("data: {\"error\":{\"message\":\"rate limited\"},\"content\":\"x\"}\n\n");
        assert_eq!(
            frames,
            vec![StreamFrame::ServerError {
                message: "rate limited".into()
            }]
        );
    }

    #[test]
    fn test_empty_content_yields_nothing() {
        assert!(parse_chunk("data: {\"content\":\"\"}\n\n").is_empty());
    }

    #[test]
    fn test_openai_shaped_delta() {
        let frames = parse_chunk(
            "data: {\"choices\":[{\"delta\":{\"content\":\"yo\"},\"finish_reason\":null}]}\n\n",
        );
        assert_eq!(frames, vec![StreamFrame::ContentDelta { text: "yo".into() }]);
    }

    #[test]
    fn test_crlf_frames() {
        let frames = parse_chunk("data: {\"content\":\"a\"}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(
            frames,
            vec![StreamFrame::ContentDelta { text: "a".into() }, StreamFrame::Done]
        );
    }

    #[test]
    fn test_carry_holds_partial_frame() {
        let mut carry = FrameCarry::new();
        assert_eq!(carry.push(b"data: {\"conte"), None);
        let released = carry.push(b"nt\":\"Hi\"}\n\ndata: {\"con").unwrap();
        assert_eq!(released, "data: {\"content\":\"Hi\"}\n\n");
        assert_eq!(carry.pending_len(), "data: {\"con".len());
        assert_eq!(carry.finish().unwrap(), "data: {\"con");
        assert_eq!(carry.finish(), None);
    }

    #[test]
    fn test_carry_never_splits_utf8() {
        let frame = "data: {\"content\":\"héllo 🌍\"}\n\n".as_bytes();
        let mut carry = FrameCarry::new();
        let mut out = String::new();
        for b in frame {
            if let Some(text) = carry.push(std::slice::from_ref(b)) {
                out.push_str(&text);
            }
        }
        assert_eq!(
            parse_chunk(&out),
            vec![StreamFrame::ContentDelta {
                text: "héllo 🌍".into()
            }]
        );
    }
}
