//! Channel addressing: one logical channel per (document, section) pair.
//!
//! Rendered as `/report/{document_id}/section/{section_id}`, each segment
//! percent-encoded the way browsers' `encodeURIComponent` does it.

use std::borrow::Cow;
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Address of a section channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    pub document_id: String,
    pub section_id: String,
}

impl ChannelAddress {
    pub fn new(document_id: impl Into<String>, section_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            section_id: section_id.into(),
        }
    }

    /// Request path for this channel.
    pub fn path(&self) -> String {
        format!(
            "/report/{}/section/{}",
            encode_component(&self.document_id),
            encode_component(&self.section_id)
        )
    }

    /// Full WebSocket URL under `server_url` (e.g. `ws://127.0.0.1:8080`).
    pub fn url(&self, server_url: &str) -> String {
        format!("{}{}", server_url.trim_end_matches('/'), self.path())
    }

    /// Parse a request path produced by [`ChannelAddress::path`].
    pub fn parse_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        let mut parts = path.trim_start_matches('/').split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("report"), Some(doc), Some("section"), Some(section), None)
                if !doc.is_empty() && !section.is_empty() =>
            {
                Some(Self::new(decode_component(doc)?, decode_component(section)?))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.section_id)
    }
}

/// Everything `encodeURIComponent` escapes.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Strict decode: every `%` must start a two-digit hex escape.
fn decode_component(s: &str) -> Option<String> {
    let well_formed = s.split('%').skip(1).all(|rest| {
        rest.get(..2)
            .is_some_and(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
    });
    if !well_formed {
        return None;
    }
    percent_decode_str(s).decode_utf8().ok().map(Cow::into_owned)
}
