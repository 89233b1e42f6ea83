//! Collaborator interfaces consumed by the session controller.
//!
//! The report catalog, access control and the rich-text editing surface live
//! outside the sync layer. The controller only sees these traits; in-memory
//! implementations are provided for tests and headless clients.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::Delta;

/// Table-of-contents entry for one section of a report.
///
/// Deserializes from the catalog's `{"Title": …, "Subsections": [...]}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDescriptor {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Subsections", default)]
    pub subsection_titles: Vec<String>,
}

impl SectionDescriptor {
    pub fn new<I, S>(title: impl Into<String>, subsections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title: title.into(),
            subsection_titles: subsections.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("document '{0}' not found")]
    DocumentNotFound(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("invalid catalog data: {0}")]
    InvalidData(String),
}

/// Report catalog: source of section descriptors.
pub trait Catalog: Send + Sync {
    fn list_sections(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<Vec<SectionDescriptor>, CollaboratorError>> + Send;
}

/// Access-control service.
pub trait AccessControl: Send + Sync {
    fn is_admin(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<bool, CollaboratorError>> + Send;
}

/// The visual editing surface for the open section's fields.
///
/// Local edits flow the other way, through
/// [`SessionHandle::local_change`](crate::session::SessionHandle::local_change).
pub trait EditorSurface: Send {
    /// A section was opened; one editor per subsection should be shown.
    fn section_mounted(&mut self, descriptor: &SectionDescriptor);

    /// A remote peer changed a field.
    fn apply_remote_change(&mut self, field_id: &str, ops: &Delta);

    /// A field's content was replaced wholesale by a snapshot.
    fn replace_content(&mut self, field_id: &str, content: &Delta);
}

/// Surface that renders nothing (headless clients).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl EditorSurface for NullSurface {
    fn section_mounted(&mut self, _descriptor: &SectionDescriptor) {}
    fn apply_remote_change(&mut self, _field_id: &str, _ops: &Delta) {}
    fn replace_content(&mut self, _field_id: &str, _content: &Delta) {}
}

// ───────────────────────────────────────────────────────────────────
// In-memory collaborators
// ───────────────────────────────────────────────────────────────────

/// Catalog backed by a fixed table of contents per document.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    documents: HashMap<String, Vec<SectionDescriptor>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document's sections.
    pub fn with_document(
        mut self,
        document_id: impl Into<String>,
        sections: Vec<SectionDescriptor>,
    ) -> Self {
        self.documents.insert(document_id.into(), sections);
        self
    }

    /// Parse a JSON array of `{"Title", "Subsections"}` entries for one document.
    pub fn from_json(document_id: impl Into<String>, json: &str) -> Result<Self, CollaboratorError> {
        let sections: Vec<SectionDescriptor> = serde_json::from_str(json)
            .map_err(|e| CollaboratorError::InvalidData(e.to_string()))?;
        Ok(Self::new().with_document(document_id, sections))
    }
}

impl Catalog for StaticCatalog {
    async fn list_sections(
        &self,
        document_id: &str,
    ) -> Result<Vec<SectionDescriptor>, CollaboratorError> {
        self.documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::DocumentNotFound(document_id.to_string()))
    }
}

/// Access control backed by a fixed set of documents the user administers.
#[derive(Debug, Default, Clone)]
pub struct StaticAccessControl {
    admin_of: HashSet<String>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, document_id: impl Into<String>) -> Self {
        self.admin_of.insert(document_id.into());
        self
    }
}

impl AccessControl for StaticAccessControl {
    async fn is_admin(&self, document_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.admin_of.contains(document_id))
    }
}
