//! Whole-document assembly: head, global styles, body, embedded blocks.

use maud::{html, Markup, PreEscaped, DOCTYPE};
use serde::Serialize;

use aide_core::entity::ParentRef;
use aide_core::event::PageEvent;
use aide_core::state::PageState;

use crate::component::render_entity;
use crate::{
    Blueprint, RenderOptions, BLUEPRINT_CONTENT_TYPE, EVENTS_CONTENT_TYPE, SNAPSHOT_CONTENT_TYPE,
};

/// Baseline stylesheet; page styles layer on top as custom properties.
const BASE_CSS: &str = "\
body { margin: 0 auto; max-width: 46rem; padding: 1.5rem; \
font-family: system-ui, sans-serif; line-height: 1.5; }\n\
.a-card, .a-table, .a-list, .a-checklist { margin: 1rem 0; }\n\
.a-metric-value { font-size: 1.8rem; margin-right: 0.5rem; }\n\
table { border-collapse: collapse; width: 100%; }\n\
th, td { text-align: left; padding: 0.25rem 0.75rem 0.25rem 0; }\n\
.a-checklist ul, .a-list ul { list-style: none; padding-left: 0; }\n\
.a-props dt { font-weight: 600; }\n";

pub(crate) fn render_document(
    state: &PageState,
    blueprint: &Blueprint,
    events: &[PageEvent],
    options: &RenderOptions,
) -> Markup {
    let title = if state.meta.title.is_empty() {
        "Untitled page"
    } else {
        state.meta.title.as_str()
    };

    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) }
                style { (PreEscaped(BASE_CSS)) (PreEscaped(page_css(state))) }
            }
            body {
                main .a-page {
                    header {
                        h1 { (title) }
                        @if !state.meta.identity.is_empty() {
                            p .a-identity { (state.meta.identity) }
                        }
                    }
                    @for child in state.live_children_of(&ParentRef::Root) {
                        (render_entity(state, child))
                    }
                }
                @if let Some(footer) = &options.footer {
                    footer .a-footer { (footer) }
                }
                (data_block(BLUEPRINT_CONTENT_TYPE, blueprint))
                (data_block(SNAPSHOT_CONTENT_TYPE, state))
                @if !options.omit_events {
                    (data_block(EVENTS_CONTENT_TYPE, &events))
                }
            }
        }
    }
}

/// Page-level styles as CSS custom properties on `:root`.
fn page_css(state: &PageState) -> String {
    if state.styles.is_empty() {
        return String::new();
    }
    let mut css = String::from(":root { ");
    for (key, value) in &state.styles {
        css.push_str(&format!("--{key}: {value}; "));
    }
    css.push_str("}\n");
    css
}

/// One typed, recoverable data block.
///
/// `<` is JSON-escaped so a literal `</script>` inside a string cannot
/// terminate the element; the escape is transparent to JSON parsers.
fn data_block<T: Serialize>(content_type: &str, value: &T) -> Markup {
    let json = serde_json::to_string(value)
        .expect("Can't fail")
        .replace('<', "\\u003c");
    html! {
        script type=(content_type) { (PreEscaped(json)) }
    }
}
