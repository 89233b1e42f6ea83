//! Field registry: the replicas of the currently open section.
//!
//! The registry is rebuilt wholesale on every section switch. Its key set is
//! always exactly the subsection titles of the open section, in table-of-
//! contents order.

use indexmap::IndexMap;
use thiserror::Error;

use crate::catalog::SectionDescriptor;
use crate::delta::{Delta, DeltaError};
use crate::replica::DocumentReplica;

/// Snapshot payload: field id → insert-from-empty ops, in TOC order.
pub type FieldSnapshot = IndexMap<String, Delta>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no field '{0}' in the open section")]
    UnknownField(String),

    #[error("replica '{field_id}' rejected a change: {source}")]
    ReplicaCorrupted {
        field_id: String,
        #[source]
        source: DeltaError,
    },
}

/// Maps field ids of the open section to their replicas.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    section: Option<String>,
    replicas: IndexMap<String, DocumentReplica>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry for a section: one empty replica per subsection.
    ///
    /// Prior contents are discarded without flushing.
    pub fn open_section(&mut self, descriptor: &SectionDescriptor) {
        self.replicas.clear();
        for title in &descriptor.subsection_titles {
            if self.replicas.contains_key(title) {
                log::warn!(
                    "Section '{}' lists subsection '{}' twice; keeping one field",
                    descriptor.title,
                    title
                );
                continue;
            }
            self.replicas.insert(title.clone(), DocumentReplica::new(title.clone()));
        }
        self.section = Some(descriptor.title.clone());
        log::debug!(
            "Opened section '{}' with {} fields",
            descriptor.title,
            self.replicas.len()
        );
    }

    /// Discard every replica.
    pub fn close(&mut self) {
        self.replicas.clear();
        self.section = None;
    }

    pub fn is_open(&self) -> bool {
        self.section.is_some()
    }

    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn field_ids(&self) -> impl Iterator<Item = &str> {
        self.replicas.keys().map(String::as_str)
    }

    pub fn get(&self, field_id: &str) -> Option<&DocumentReplica> {
        self.replicas.get(field_id)
    }

    pub fn get_mut(&mut self, field_id: &str) -> Option<&mut DocumentReplica> {
        self.replicas.get_mut(field_id)
    }

    /// Iterate `(field_id, replica)` in TOC order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DocumentReplica)> {
        self.replicas.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Apply an inbound change to the named field.
    pub fn apply_change(&mut self, field_id: &str, ops: &Delta) -> Result<(), RegistryError> {
        let replica = self
            .replicas
            .get_mut(field_id)
            .ok_or_else(|| RegistryError::UnknownField(field_id.to_string()))?;
        replica.apply(ops).map_err(|source| RegistryError::ReplicaCorrupted {
            field_id: field_id.to_string(),
            source,
        })
    }

    /// Apply a local edit and return the ops to transmit.
    pub fn record_local_change(
        &mut self,
        field_id: &str,
        ops: Delta,
    ) -> Result<Delta, RegistryError> {
        let replica = self
            .replicas
            .get_mut(field_id)
            .ok_or_else(|| RegistryError::UnknownField(field_id.to_string()))?;
        replica
            .record_local_change(ops)
            .map_err(|source| RegistryError::ReplicaCorrupted {
                field_id: field_id.to_string(),
                source,
            })
    }

    /// Replace the content of every listed field that belongs to this section.
    ///
    /// Returns the ids that were replaced; foreign or non-document entries are
    /// skipped and logged.
    pub fn apply_snapshot(&mut self, fields: &FieldSnapshot) -> Vec<String> {
        let mut replaced = Vec::with_capacity(fields.len());
        for (field_id, content) in fields {
            let Some(replica) = self.replicas.get_mut(field_id) else {
                log::warn!("Snapshot names unknown field '{field_id}', skipping");
                continue;
            };
            match replica.replace(content.clone()) {
                Ok(()) => replaced.push(field_id.clone()),
                Err(e) => log::warn!("Snapshot entry for '{field_id}' rejected: {e}"),
            }
        }
        replaced
    }

    /// Every field's current ops, in TOC order.
    pub fn snapshot_all(&self) -> FieldSnapshot {
        self.replicas
            .iter()
            .map(|(id, replica)| (id.clone(), replica.current_ops()))
            .collect()
    }

    pub fn has_pending_local(&self) -> bool {
        self.replicas.values().any(DocumentReplica::pending_local)
    }

    pub fn mark_published(&mut self) {
        for replica in self.replicas.values_mut() {
            replica.mark_published();
        }
    }
}
