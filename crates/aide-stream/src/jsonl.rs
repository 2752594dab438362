//! Legacy line-per-primitive adapter.
//!
//! Older tiers emitted one JSON object per line, already shaped like a
//! primitive (`{"type": "entity.create", "payload": {…}}`). The adapter
//! re-frames those lines into the same stream items the tool-use path
//! produces, so the orchestrator never sees the difference.

use aide_core::primitive::Primitive;

use crate::{classify, StreamItem};

#[derive(Debug, Default)]
pub struct JsonlParser {
    line_buf: Vec<u8>,
}

impl JsonlParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        self.line_buf.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(newline) = self.line_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=newline).collect();
            consume_line(&line[..line.len() - 1], &mut items);
        }
        items
    }

    pub fn finish(&mut self) -> Vec<StreamItem> {
        let mut items = Vec::new();
        if !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            consume_line(&line, &mut items);
        }
        items.push(StreamItem::StreamEnd);
        items
    }
}

fn consume_line(line: &[u8], items: &mut Vec<StreamItem>) {
    let Ok(line) = std::str::from_utf8(line) else {
        items.push(StreamItem::ParseError {
            code: "PARSE_ERROR",
            detail: "Non-UTF-8 line".into(),
            raw: String::from_utf8_lossy(line).into_owned(),
        });
        return;
    };
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Primitive>(line) {
        Ok(primitive) => items.push(classify(primitive)),
        Err(err) => items.push(StreamItem::ParseError {
            code: "PARSE_ERROR",
            detail: format!("Bad primitive line: {err}"),
            raw: line.to_owned(),
        }),
    }
}
