//! Per-entity component rendering.
//!
//! Entities render parent-before-children; children follow the state's
//! child order; removed entities are skipped entirely.

use maud::{html, Markup};

use aide_core::entity::{DisplayHint, Entity, ParentRef};
use aide_core::prop::{PropValue, Props};
use aide_core::state::PageState;

/// Keys that hold an entity's human-facing label, in lookup order.
const LABEL_KEYS: &[&str] = &["title", "name", "label"];

pub(crate) fn label_of(props: &Props) -> Option<&str> {
    LABEL_KEYS.iter().find_map(|k| props.get(*k)?.as_str())
}

/// Resolve the effective display for an entity, inferring one when the
/// hint is absent.
pub(crate) fn effective_display(state: &PageState, entity: &Entity) -> DisplayHint {
    if let Some(display) = entity.display {
        return display;
    }
    let children = state.live_children_of(&ParentRef::Entity(entity.id.clone()));
    if entity.props.contains_key("src") {
        return DisplayHint::Image;
    }
    if entity.props.contains_key("value") && entity.props.len() <= 3 {
        return DisplayHint::Metric;
    }
    if children.iter().any(|c| c.props.contains_key("done")) {
        return DisplayHint::Checklist;
    }
    if shared_field_count(&children) >= 3 {
        return DisplayHint::Table;
    }
    if children.is_empty() {
        DisplayHint::Card
    } else {
        DisplayHint::List
    }
}

/// Number of prop keys shared by every child (zero when childless).
fn shared_field_count(children: &[&Entity]) -> usize {
    let Some((first, rest)) = children.split_first() else {
        return 0;
    };
    first
        .props
        .keys()
        .filter(|k| rest.iter().all(|c| c.props.contains_key(*k)))
        .count()
}

fn inline_style(styles: &Props) -> Option<String> {
    if styles.is_empty() {
        return None;
    }
    let css: Vec<String> = styles.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    Some(css.join("; "))
}

pub(crate) fn render_entity(state: &PageState, entity: &Entity) -> Markup {
    let display = effective_display(state, entity);
    let children = state.live_children_of(&ParentRef::Entity(entity.id.clone()));
    let style = inline_style(&entity.styles);

    html! {
        @match display {
            DisplayHint::Page | DisplayHint::Section => {
                section class={ "a-" (display) } data-entity=(entity.id) style=[style] {
                    @if let Some(label) = label_of(&entity.props) {
                        h2 { (label) }
                    }
                    (render_scalar_props(entity, &["title", "name", "label"]))
                    @for child in &children {
                        (render_entity(state, child))
                    }
                }
            }
            DisplayHint::Card => {
                article .a-card data-entity=(entity.id) style=[style] {
                    @if let Some(label) = label_of(&entity.props) {
                        h3 { (label) }
                    }
                    (render_scalar_props(entity, &["title", "name", "label"]))
                    @for child in &children {
                        (render_entity(state, child))
                    }
                }
            }
            DisplayHint::List => {
                div .a-list data-entity=(entity.id) style=[style] {
                    @if let Some(label) = label_of(&entity.props) {
                        h3 { (label) }
                    }
                    ul {
                        @for child in &children {
                            li { (render_entity(state, child)) }
                        }
                    }
                }
            }
            DisplayHint::Table => (render_table(state, entity, &children, style)),
            DisplayHint::Checklist => {
                div .a-checklist data-entity=(entity.id) style=[style] {
                    @if let Some(label) = label_of(&entity.props) {
                        h3 { (label) }
                    }
                    ul {
                        @for child in &children {
                            @let done = child.props.get("done")
                                .and_then(PropValue::as_bool)
                                .unwrap_or(false);
                            li data-entity=(child.id) {
                                input type="checkbox" disabled checked[done];
                                " "
                                (label_of(&child.props).unwrap_or(child.id.as_str()))
                            }
                        }
                    }
                }
            }
            DisplayHint::Metric => {
                div .a-metric data-entity=(entity.id) style=[style] {
                    @if let Some(value) = entity.props.get("value") {
                        strong .a-metric-value { (value) }
                    }
                    @if let Some(label) = label_of(&entity.props) {
                        span .a-metric-label { (label) }
                    }
                }
            }
            DisplayHint::Text => {
                p .a-text data-entity=(entity.id) style=[style] {
                    (entity.props.get("text")
                        .or_else(|| entity.props.get("content"))
                        .map(ToString::to_string)
                        .or_else(|| label_of(&entity.props).map(ToString::to_string))
                        .unwrap_or_default())
                }
            }
            DisplayHint::Image => {
                figure .a-image data-entity=(entity.id) style=[style] {
                    @if let Some(src) = entity.props.get("src").and_then(PropValue::as_str) {
                        img src=(src) alt=(label_of(&entity.props).unwrap_or(""));
                    }
                    @if let Some(label) = label_of(&entity.props) {
                        figcaption { (label) }
                    }
                }
            }
            DisplayHint::Row => {
                // A row outside a table renders as a flat value strip.
                div .a-row data-entity=(entity.id) style=[style] {
                    @for (key, value) in &entity.props {
                        span .a-cell data-field=(key) { (value) }
                    }
                }
            }
        }
    }
}

fn render_table(
    state: &PageState,
    entity: &Entity,
    children: &[&Entity],
    style: Option<String>,
) -> Markup {
    // Columns: union of child prop keys, first-appearance order.
    let mut columns: Vec<&str> = Vec::new();
    for child in children {
        for key in child.props.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    html! {
        div .a-table data-entity=(entity.id) style=[style] {
            @if let Some(label) = label_of(&entity.props) {
                h3 { (label) }
            }
            table {
                @if !columns.is_empty() {
                    thead {
                        tr {
                            @for column in &columns {
                                th { (column) }
                            }
                        }
                    }
                }
                tbody {
                    @for child in children {
                        tr data-entity=(child.id) {
                            @for column in &columns {
                                td data-field=(column) {
                                    @if let Some(value) = child.props.get(*column) {
                                        (value)
                                    }
                                }
                            }
                        }
                    }
                }
            }
            // Rows may themselves have children (nested detail).
            @for child in children {
                @let nested = state.live_children_of(&ParentRef::Entity(child.id.clone()));
                @for grandchild in nested {
                    (render_entity(state, grandchild))
                }
            }
        }
    }
}

/// Scalar props not already shown as the label, as a definition list.
fn render_scalar_props(entity: &Entity, skip: &[&str]) -> Markup {
    let shown: Vec<(&String, &PropValue)> = entity
        .props
        .iter()
        .filter(|(k, v)| !skip.contains(&k.as_str()) && v.is_scalar())
        .collect();
    html! {
        @if !shown.is_empty() {
            dl .a-props {
                @for (key, value) in shown {
                    dt { (key) }
                    dd { (value) }
                }
            }
        }
    }
}
