//! Rendering of page state into a single self-describing HTML document,
//! and the inverse parser that recovers the embedded structured blocks.
//!
//! The document carries three typed data blocks (blueprint, snapshot,
//! event log) as `<script>` elements; a parser locates them strictly by
//! their `type` attribute, never by regex.

mod component;
mod document;
mod parse;
mod text;


use serde::{Deserialize, Serialize};

use aide_core::event::PageEvent;
use aide_core::prop::Props;
use aide_core::state::PageState;

pub use self::parse::{parse, ParseDocError, ParsedDocument};
pub use self::text::render_text;

pub const BLUEPRINT_CONTENT_TYPE: &str = "application/vnd.aide.blueprint+json";
pub const SNAPSHOT_CONTENT_TYPE: &str = "application/vnd.aide.snapshot+json";
pub const EVENTS_CONTENT_TYPE: &str = "application/vnd.aide.events+json";

/// Static scaffolding embedded in each page document to make it
/// portable: who the page speaks as and the prompt it was grown from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Props::is_empty")]
    pub display_defaults: Props,
}

#[derive(Clone, Debug, Default)]
pub struct RenderOptions {
    /// Strip the event log block (published copies of long logs).
    pub omit_events: bool,
    /// Extra footer markup-free text, injected for free-tier publishes.
    pub footer: Option<String>,
}

/// Render the full document with default options.
///
/// Pure and deterministic: the same state, blueprint and events always
/// produce the same bytes.
pub fn render(state: &PageState, blueprint: &Blueprint, events: &[PageEvent]) -> String {
    render_with(state, blueprint, events, &RenderOptions::default())
}

pub fn render_with(
    state: &PageState,
    blueprint: &Blueprint,
    events: &[PageEvent],
    options: &RenderOptions,
) -> String {
    document::render_document(state, blueprint, events, options).into_string()
}
