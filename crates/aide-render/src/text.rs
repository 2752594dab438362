//! Plain-text outline variant of a page.

use std::fmt::Write as _;

use aide_core::entity::{Entity, ParentRef};
use aide_core::state::PageState;

use crate::component::label_of;

pub fn render_text(state: &PageState) -> String {
    let mut out = String::new();
    let title = if state.meta.title.is_empty() {
        "Untitled page"
    } else {
        state.meta.title.as_str()
    };
    let _ = writeln!(out, "# {title}");
    if !state.meta.identity.is_empty() {
        let _ = writeln!(out, "{}", state.meta.identity);
    }
    for child in state.live_children_of(&ParentRef::Root) {
        write_entity(state, child, 0, &mut out);
    }
    out
}

fn write_entity(state: &PageState, entity: &Entity, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let label = label_of(&entity.props)
        .map(ToString::to_string)
        .unwrap_or_else(|| entity.id.to_string());
    let _ = write!(out, "{indent}- {label}");

    let details: Vec<String> = entity
        .props
        .iter()
        .filter(|(k, _)| !is_label_key(k))
        .map(|(k, v)| format!("{k}: {v}"))
        .collect();
    if !details.is_empty() {
        let _ = write!(out, " ({})", details.join(", "));
    }
    let _ = writeln!(out);

    for child in state.live_children_of(&ParentRef::Entity(entity.id.clone())) {
        write_entity(state, child, depth + 1, out);
    }
}

fn is_label_key(key: &str) -> bool {
    matches!(key, "title" | "name" | "label")
}
