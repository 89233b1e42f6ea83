//! Per-report activity log kept by the relay.
//!
//! Every routed message appends one entry under its report. Each report keeps
//! at most `capacity` entries; the oldest are evicted first.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::SystemTime;

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Joined,
    Changed,
    Synced,
    Published,
    Left,
}

impl ActivityKind {
    pub fn describe(self) -> &'static str {
        match self {
            ActivityKind::Joined => "joined a report section",
            ActivityKind::Changed => "sent a delta update",
            ActivityKind::Synced => "synced content",
            ActivityKind::Published => "triggered repository update",
            ActivityKind::Left => "closed a section connection",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub at: SystemTime,
    /// Who did it (the peer's label).
    pub actor: String,
    pub section_id: String,
    pub kind: ActivityKind,
}

impl ActivityEntry {
    pub fn new(actor: impl Into<String>, section_id: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            at: SystemTime::now(),
            actor: actor.into(),
            section_id: section_id.into(),
            kind,
        }
    }
}

impl fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self
            .at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        write!(
            f,
            "[{secs}] {} {} ({})",
            self.actor,
            self.kind.describe(),
            self.section_id
        )
    }
}

/// Bounded, in-memory activity history per report.
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    reports: RwLock<HashMap<String, VecDeque<ActivityEntry>>>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            reports: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, document_id: &str, entry: ActivityEntry) {
        log::trace!("Activity on {document_id}: {entry}");
        let mut reports = self.reports.write().await;
        let entries = reports.entry(document_id.to_string()).or_default();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries for one report, oldest first.
    pub async fn entries(&self, document_id: &str) -> Vec<ActivityEntry> {
        self.reports
            .read()
            .await
            .get(document_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn report_count(&self) -> usize {
        self.reports.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_are_kept_per_report_in_order() {
        let log = ActivityLog::new(10);
        log.record("r1", ActivityEntry::new("alice", "Intro", ActivityKind::Joined)).await;
        log.record("r2", ActivityEntry::new("bob", "Scope", ActivityKind::Joined)).await;
        log.record("r1", ActivityEntry::new("alice", "Intro", ActivityKind::Changed)).await;

        let kinds: Vec<ActivityKind> = log.entries("r1").await.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ActivityKind::Joined, ActivityKind::Changed]);
        assert_eq!(log.entries("r2").await.len(), 1);
        assert!(log.entries("r3").await.is_empty());
        assert_eq!(log.report_count().await, 2);
    }

    #[tokio::test]
    async fn test_oldest_entries_are_evicted() {
        let log = ActivityLog::new(3);
        for section in ["a", "b", "c", "d", "e"] {
            log.record("r1", ActivityEntry::new("alice", section, ActivityKind::Changed)).await;
        }

        let sections: Vec<String> = log.entries("r1").await.into_iter().map(|e| e.section_id).collect();
        assert_eq!(sections, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_entry_display() {
        let entry = ActivityEntry::new("alice", "Intro", ActivityKind::Published);
        let text = entry.to_string();
        assert!(text.ends_with("alice triggered repository update (Intro)"));
        assert_eq!(ActivityLog::new(0).capacity(), 1);
    }
}
