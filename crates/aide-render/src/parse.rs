//! The inverse of rendering: locate the typed data blocks and decode
//! them back into blueprint, snapshot and event log.

use scraper::{Html, Selector};
use snafu::{ResultExt as _, Snafu};

use aide_core::event::PageEvent;
use aide_core::state::{PageState, STATE_VERSION};

use crate::{Blueprint, BLUEPRINT_CONTENT_TYPE, EVENTS_CONTENT_TYPE, SNAPSHOT_CONTENT_TYPE};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedDocument {
    pub blueprint: Option<Blueprint>,
    pub snapshot: Option<PageState>,
    pub events: Vec<PageEvent>,
}

#[derive(Debug, Snafu)]
pub enum ParseDocError {
    #[snafu(display("Malformed {block} block: {source}"))]
    MalformedBlock {
        block: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("Snapshot version {version} exceeds supported {STATE_VERSION}"))]
    VersionTooHigh { version: u32 },
}

pub type ParseDocResult<T> = std::result::Result<T, ParseDocError>;

/// Extract the embedded blocks from a page document.
///
/// Absent blueprint or event log is tolerated; a snapshot from a newer
/// format version is not.
pub fn parse(html: &str) -> ParseDocResult<ParsedDocument> {
    let document = Html::parse_document(html);

    let blueprint = block_text(&document, BLUEPRINT_CONTENT_TYPE)
        .map(|text| serde_json::from_str(&text).context(MalformedBlockSnafu { block: "blueprint" }))
        .transpose()?;

    let snapshot: Option<PageState> = block_text(&document, SNAPSHOT_CONTENT_TYPE)
        .map(|text| serde_json::from_str(&text).context(MalformedBlockSnafu { block: "snapshot" }))
        .transpose()?;
    if let Some(snapshot) = &snapshot {
        if STATE_VERSION < snapshot.version {
            return VersionTooHighSnafu {
                version: snapshot.version,
            }
            .fail();
        }
    }

    let events = block_text(&document, EVENTS_CONTENT_TYPE)
        .map(|text| serde_json::from_str(&text).context(MalformedBlockSnafu { block: "events" }))
        .transpose()?
        .unwrap_or_default();

    Ok(ParsedDocument {
        blueprint,
        snapshot,
        events,
    })
}

/// Inner text of the `<script>` element with the given `type` attribute.
fn block_text(document: &Html, content_type: &str) -> Option<String> {
    let selector = Selector::parse(&format!("script[type=\"{content_type}\"]"))
        .expect("Static selector is valid");
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>())
}
