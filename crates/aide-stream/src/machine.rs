//! The block state machine: `Idle → Text → Idle` and
//! `Idle → ToolJson → Idle`, driven by delimited transport events.

use serde::Deserialize;
use tracing::trace;

use crate::decompose::decompose_tool;
use crate::{classify, StreamItem};

const LOG_TARGET: &str = "aide::stream";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TransportEvent {
    ContentBlockStart { content_block: ContentBlock },
    ContentBlockDelta { delta: Delta },
    ContentBlockStop,
    MessageStop,
    /// Keep-alives and envelope events we have no use for.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text,
    ToolUse { name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Default)]
enum BlockState {
    #[default]
    Idle,
    Text {
        buf: String,
    },
    ToolJson {
        name: String,
        buf: String,
    },
}

/// Incremental parser over the transport byte stream.
///
/// Tolerates chunk boundaries anywhere, including inside a UTF-8
/// sequence; only whole primitives are ever emitted.
#[derive(Debug, Default)]
pub struct StreamParser {
    line_buf: Vec<u8>,
    state: BlockState,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every item completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        self.line_buf.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(newline) = self.line_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=newline).collect();
            self.consume_line(&line[..line.len() - 1], &mut items);
        }
        items
    }

    /// Signal transport end-of-stream; flushes whatever is buffered.
    pub fn finish(&mut self) -> Vec<StreamItem> {
        let mut items = Vec::new();
        if !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            self.consume_line(&line, &mut items);
        }
        match std::mem::take(&mut self.state) {
            BlockState::Idle => {}
            BlockState::Text { buf } => {
                if !buf.is_empty() {
                    items.push(StreamItem::Voice(buf));
                }
            }
            BlockState::ToolJson { name, buf } => {
                items.push(StreamItem::ParseError {
                    code: "PARSE_ERROR",
                    detail: format!("Stream ended inside `{name}` tool block"),
                    raw: buf,
                });
            }
        }
        items
    }

    fn consume_line(&mut self, line: &[u8], items: &mut Vec<StreamItem>) {
        let Ok(line) = std::str::from_utf8(line) else {
            items.push(StreamItem::ParseError {
                code: "PARSE_ERROR",
                detail: "Non-UTF-8 transport line".into(),
                raw: String::from_utf8_lossy(line).into_owned(),
            });
            return;
        };
        // Tolerate SSE-style framing.
        let line = line.strip_prefix("data:").unwrap_or(line).trim();
        if line.is_empty() {
            return;
        }

        let event: TransportEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                items.push(StreamItem::ParseError {
                    code: "PARSE_ERROR",
                    detail: format!("Bad transport event: {err}"),
                    raw: line.to_owned(),
                });
                return;
            }
        };
        self.step(event, items);
    }

    fn step(&mut self, event: TransportEvent, items: &mut Vec<StreamItem>) {
        match event {
            TransportEvent::ContentBlockStart { content_block } => {
                // A start while mid-block means the stop was lost; flush
                // what we had as best effort.
                if !matches!(self.state, BlockState::Idle) {
                    self.close_block(items);
                }
                self.state = match content_block {
                    ContentBlock::Text => BlockState::Text { buf: String::new() },
                    ContentBlock::ToolUse { name } => {
                        trace!(target: LOG_TARGET, tool = %name, "Tool block start");
                        BlockState::ToolJson {
                            name,
                            buf: String::new(),
                        }
                    }
                };
            }
            TransportEvent::ContentBlockDelta { delta } => match (&mut self.state, delta) {
                (BlockState::Text { buf }, Delta::TextDelta { text }) => buf.push_str(&text),
                (BlockState::ToolJson { buf, .. }, Delta::InputJsonDelta { partial_json }) => {
                    buf.push_str(&partial_json)
                }
                (_, delta) => {
                    items.push(StreamItem::ParseError {
                        code: "PARSE_ERROR",
                        detail: "Delta outside a matching block".into(),
                        raw: format!("{delta:?}"),
                    });
                }
            },
            TransportEvent::ContentBlockStop => self.close_block(items),
            TransportEvent::MessageStop => {
                self.close_block(items);
                items.push(StreamItem::StreamEnd);
            }
            TransportEvent::Other => {}
        }
    }

    fn close_block(&mut self, items: &mut Vec<StreamItem>) {
        match std::mem::take(&mut self.state) {
            BlockState::Idle => {}
            BlockState::Text { buf } => {
                if !buf.is_empty() {
                    items.push(StreamItem::Voice(buf));
                }
            }
            BlockState::ToolJson { name, buf } => match decompose_tool(&name, &buf) {
                Ok(primitive) => items.push(classify(primitive)),
                Err(err) => items.push(StreamItem::ParseError {
                    code: err.code(),
                    detail: err.to_string(),
                    raw: buf,
                }),
            },
        }
    }
}
