//! In-memory replica of one editable field.
//!
//! The replica holds the field's content as a document delta and accepts
//! changes from two directions:
//!
//! ```text
//! editor surface ──record_local_change──┐
//!                                       ├──▸ content = content ∘ change
//! channel (remote peer) ──apply─────────┘
//! ```
//!
//! Concurrent changes to the same field are applied in arrival order with no
//! transform step: the last change applied wins. Peers converge only after a
//! snapshot exchange.

use crate::delta::{Delta, DeltaError};

/// Replica of a single field's rich-text content.
#[derive(Debug, Clone)]
pub struct DocumentReplica {
    field_id: String,
    content: Delta,
    /// Local edits not yet covered by a published snapshot.
    pending_local: bool,
}

impl DocumentReplica {
    /// Create an empty replica.
    pub fn new(field_id: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            content: Delta::new(),
            pending_local: false,
        }
    }

    pub fn field_id(&self) -> &str {
        &self.field_id
    }

    pub fn content(&self) -> &Delta {
        &self.content
    }

    /// Content length in UTF-16 code units.
    pub fn len(&self) -> usize {
        self.content.target_len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn pending_local(&self) -> bool {
        self.pending_local
    }

    /// Compose a change onto the content.
    ///
    /// A change reaching past the end of the content, or cutting a character
    /// in half, is rejected and never clamped. The replica is left untouched
    /// in that case.
    pub fn apply(&mut self, ops: &Delta) -> Result<(), DeltaError> {
        let doc_len = self.len();
        let base_len = ops.base_len();
        if base_len > doc_len {
            return Err(DeltaError::OutOfRange { base_len, doc_len });
        }
        if let Some(offset) = self.content.split_point(ops) {
            return Err(DeltaError::SplitCharacter { offset });
        }
        self.content = self.content.compose(ops);
        Ok(())
    }

    /// Apply a user-originated change and hand it back for transmission.
    pub fn record_local_change(&mut self, ops: Delta) -> Result<Delta, DeltaError> {
        self.apply(&ops)?;
        self.pending_local = true;
        Ok(ops)
    }

    /// The content as an insert-from-empty operation log.
    pub fn current_ops(&self) -> Delta {
        self.content.clone()
    }

    /// Replace the whole content (snapshot sync).
    pub fn replace(&mut self, content: Delta) -> Result<(), DeltaError> {
        if !content.is_document() {
            return Err(DeltaError::NotADocument);
        }
        self.content = content;
        Ok(())
    }

    /// Drop all content, e.g. before a forced resync.
    pub fn reset(&mut self) {
        self.content = Delta::new();
        self.pending_local = false;
    }

    pub fn mark_published(&mut self) {
        self.pending_local = false;
    }
}
