//! Section session controller.
//!
//! Owns the field registry and the active session channel, and moves the
//! client between sections:
//!
//! ```text
//!               switch_to(s)                 open done
//!  NoSection ───────────────▸ SwitchingSection ───────▸ SectionOpen
//!      ▲                        │    ▲                       │
//!      │      not in catalog    │    └──── switch_to(s') ────┘
//!      └────────────────────────┘
//!                               └── "settings" ──▸ Settings
//!
//!  any ── on_page_teardown ──▸ TornDown
//! ```
//!
//! Leaving a section always publishes a full snapshot, then `Leave`, then
//! closes the channel, and only then opens the next one. The authority
//! therefore sees the publish for the old section before the join for the
//! new one.
//!
//! The controller is driven either directly (`&mut self` methods) or through
//! [`SessionController::start`], which spawns [`SessionController::run`] and
//! returns a [`SessionHandle`].

use std::collections::{HashSet, VecDeque};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::address::ChannelAddress;
use crate::catalog::{AccessControl, Catalog, CollaboratorError, EditorSurface, NullSurface};
use crate::channel::{ChannelError, ChannelEvent, ChannelState, SessionChannel};
use crate::config::SessionConfig;
use crate::delta::Delta;
use crate::protocol::{Message, ProtocolError};
use crate::registry::{FieldRegistry, RegistryError};
use crate::transport::Connector;

/// Section name that opens the settings view instead of a channel.
pub const SETTINGS_SECTION: &str = "settings";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoSection,
    SwitchingSection { target: String },
    SectionOpen { section: String },
    Settings,
    TornDown,
}

/// Non-blocking notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    SectionOpened { section: String, fields: Vec<String> },
    SectionNotFound { section: String },
    SettingsOpened { is_admin: bool },
    TransportFailed { section: String, reason: String },
    ProtocolError { error: ProtocolError },
    PublishTimeout { section: String },
    ResyncForced { section: String, reason: String },
    TornDown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("no section is open")]
    NoSection,

    #[error("session has been torn down")]
    TornDown,

    #[error("session controller is not running")]
    Stopped,
}

/// Commands accepted by a running controller.
#[derive(Debug)]
pub enum Command {
    SwitchTo(String),
    LocalChange { field_id: String, ops: Delta },
    Reconnect,
    Teardown(oneshot::Sender<()>),
}

/// Cloneable host-side handle to a running controller.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn switch_to(&self, section: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::SwitchTo(section.into())).await
    }

    /// Forward an edit made on the surface.
    pub async fn local_change(
        &self,
        field_id: impl Into<String>,
        ops: Delta,
    ) -> Result<(), SessionError> {
        self.send(Command::LocalChange {
            field_id: field_id.into(),
            ops,
        })
        .await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Reconnect).await
    }

    /// Publish, leave and close; resolves once the controller has finished.
    pub async fn teardown(&self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Teardown(done_tx)).await?;
        done_rx.await.map_err(|_| SessionError::Stopped)
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)
    }
}

pub struct SessionController<C, K, A> {
    config: SessionConfig,
    document_id: String,
    connector: C,
    catalog: K,
    access: A,
    surface: Box<dyn EditorSurface>,
    registry: FieldRegistry,
    channel: Option<SessionChannel>,
    state: SessionState,
    awaiting_resync: HashSet<String>,
    notices: mpsc::Sender<SessionNotice>,
}

impl<C, K, A> SessionController<C, K, A>
where
    C: Connector,
    K: Catalog,
    A: AccessControl,
{
    /// Create a controller for one document. Returns the notice stream.
    pub fn new(
        config: SessionConfig,
        document_id: impl Into<String>,
        connector: C,
        catalog: K,
        access: A,
    ) -> (Self, mpsc::Receiver<SessionNotice>) {
        let (notice_tx, notice_rx) = mpsc::channel(config.notice_capacity.max(1));
        let controller = Self {
            config,
            document_id: document_id.into(),
            connector,
            catalog,
            access,
            surface: Box::new(NullSurface),
            registry: FieldRegistry::new(),
            channel: None,
            state: SessionState::NoSection,
            awaiting_resync: HashSet::new(),
            notices: notice_tx,
        };
        (controller, notice_rx)
    }

    /// Attach the editing surface that mirrors the registry.
    pub fn with_surface(mut self, surface: impl EditorSurface + 'static) -> Self {
        self.surface = Box::new(surface);
        self
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.channel.as_ref().map(SessionChannel::state)
    }

    /// The section currently shown, settings included.
    pub fn current_section(&self) -> Option<&str> {
        match &self.state {
            SessionState::SectionOpen { section } => Some(section),
            SessionState::Settings => Some(SETTINGS_SECTION),
            _ => None,
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Section switching
    // ───────────────────────────────────────────────────────────────

    /// Make `section` the current section.
    pub async fn switch_to(&mut self, section: &str) {
        if self.state == SessionState::TornDown {
            log::warn!("Ignoring switch to '{section}' after teardown");
            return;
        }
        if self.current_section() == Some(section) {
            log::debug!("Already on section '{section}'");
            return;
        }

        log::info!("Switching to section '{section}'");
        self.state = SessionState::SwitchingSection {
            target: section.to_string(),
        };
        self.leave_current().await;

        if section == SETTINGS_SECTION {
            self.open_settings().await;
        } else {
            self.open_section(section).await;
        }
    }

    /// Publish the open section, send `Leave`, close the channel and drop
    /// the registry.
    async fn leave_current(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let section_id = channel.address().section_id.clone();

            let published = if self.registry.is_open() && channel.is_open() {
                let fields = self.registry.snapshot_all();
                let publish = Message::snapshot_publish(&self.document_id, &section_id, fields);
                match channel.send(&publish).await {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("Snapshot publish for '{section_id}' failed: {e}");
                        self.notify(SessionNotice::PublishTimeout {
                            section: section_id.clone(),
                        });
                        false
                    }
                }
            } else {
                false
            };

            let timeout = if published {
                self.config.publish_timeout
            } else {
                self.config.close_timeout
            };

            match channel.close(timeout).await {
                Ok(()) if published => self.registry.mark_published(),
                Ok(()) => {}
                Err(e) if published => {
                    log::warn!("Publish for '{section_id}' may not have completed: {e}");
                    self.notify(SessionNotice::PublishTimeout {
                        section: section_id,
                    });
                }
                Err(e) => log::warn!("Closing channel {} failed: {e}", channel.address()),
            }
        } else if self.registry.has_pending_local() {
            log::warn!(
                "Discarding unpublished edits in '{}': no open channel",
                self.registry.section().unwrap_or_default()
            );
        }

        self.registry.close();
        self.awaiting_resync.clear();
    }

    async fn open_section(&mut self, section: &str) {
        let lookup = self
            .catalog
            .list_sections(&self.document_id)
            .await
            .map(|sections| sections.into_iter().find(|s| s.title == section));
        let descriptor = match lookup {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                log::warn!("Section '{section}' is not in the catalog of '{}'", self.document_id);
                self.state = SessionState::NoSection;
                self.notify(SessionNotice::SectionNotFound {
                    section: section.to_string(),
                });
                return;
            }
            Err(e) => {
                log::error!("Catalog lookup for '{section}' failed: {e}");
                self.state = SessionState::NoSection;
                self.notify(SessionNotice::SectionNotFound {
                    section: section.to_string(),
                });
                return;
            }
        };

        if descriptor.subsection_titles.is_empty() {
            log::info!("Section '{section}' has no subsections; no channel opened");
        } else {
            let address = ChannelAddress::new(&self.document_id, section);
            let mut channel = SessionChannel::new(address, self.config.max_protocol_errors);
            match channel.connect(&self.connector).await {
                Ok(()) => self.channel = Some(channel),
                Err(e) => self.notify(SessionNotice::TransportFailed {
                    section: section.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        self.registry.open_section(&descriptor);
        self.surface.section_mounted(&descriptor);
        self.state = SessionState::SectionOpen {
            section: section.to_string(),
        };
        self.notify(SessionNotice::SectionOpened {
            section: section.to_string(),
            fields: self.registry.field_ids().map(str::to_string).collect(),
        });
    }

    async fn open_settings(&mut self) {
        self.state = SessionState::Settings;
        let is_admin = match self.access.is_admin(&self.document_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                log::error!("Admin check for '{}' failed: {e}", self.document_id);
                false
            }
        };
        log::info!("Settings opened (admin: {is_admin})");
        self.notify(SessionNotice::SettingsOpened { is_admin });
    }

    /// Full leave/open cycle for the current section.
    async fn reopen_current(&mut self) {
        let SessionState::SectionOpen { section } = &self.state else {
            return;
        };
        let section = section.clone();
        self.state = SessionState::SwitchingSection {
            target: section.clone(),
        };
        self.leave_current().await;
        self.open_section(&section).await;
    }

    /// Reopen the current section after its channel failed.
    pub async fn reconnect(&mut self) {
        if self.channel.as_ref().is_some_and(SessionChannel::is_open) {
            log::debug!("Channel already open; nothing to reconnect");
            return;
        }
        log::info!("Reconnecting section {:?}", self.current_section());
        self.reopen_current().await;
    }

    /// Page is going away: publish, leave, close. Awaited to completion.
    pub async fn on_page_teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        log::info!("Tearing down session for '{}'", self.document_id);
        self.leave_current().await;
        self.state = SessionState::TornDown;
        self.notify(SessionNotice::TornDown);
    }

    // ───────────────────────────────────────────────────────────────
    // Edits and inbound traffic
    // ───────────────────────────────────────────────────────────────

    /// Apply an edit made locally and send it to peers.
    pub async fn local_change(&mut self, field_id: &str, ops: Delta) -> Result<(), SessionError> {
        match &self.state {
            SessionState::SectionOpen { .. } => {}
            SessionState::TornDown => return Err(SessionError::TornDown),
            _ => return Err(SessionError::NoSection),
        }

        let ops = match self.registry.record_local_change(field_id, ops) {
            Ok(ops) => ops,
            Err(e @ RegistryError::ReplicaCorrupted { .. }) => {
                self.force_resync(field_id, e.to_string()).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.awaiting_resync.remove(field_id);

        match self.channel.as_mut() {
            Some(channel) => {
                if let Err(e) = channel.send(&Message::change(field_id, ops)).await {
                    log::warn!("Change to '{field_id}' kept locally only: {e}");
                }
            }
            None => log::warn!("No channel; change to '{field_id}' kept locally only"),
        }
        Ok(())
    }

    /// Next event from the active channel; pends forever without one.
    pub async fn next_channel_event(&mut self) -> Option<ChannelEvent> {
        match self.channel.as_mut() {
            Some(channel) => channel.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(msg) => self.handle_message(msg).await,
            ChannelEvent::ProtocolError(error) => {
                self.notify(SessionNotice::ProtocolError { error });
            }
            ChannelEvent::ProtocolErrorLimit(error) => {
                log::error!("Too many undecodable frames; reopening section");
                self.notify(SessionNotice::ProtocolError { error });
                let section = self.current_section().unwrap_or_default().to_string();
                self.notify(SessionNotice::ResyncForced {
                    section,
                    reason: "repeated protocol errors".to_string(),
                });
                self.reopen_current().await;
            }
            ChannelEvent::Failed(reason) => self.drop_channel(reason),
            ChannelEvent::Closed => self.drop_channel("closed by authority".to_string()),
        }
    }

    /// Release a dead channel. The registry stays so the host keeps its view.
    fn drop_channel(&mut self, reason: String) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        log::error!("Channel {} lost: {reason}", channel.address());
        self.notify(SessionNotice::TransportFailed {
            section: channel.address().section_id.clone(),
            reason,
        });
    }

    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Change { field_id, ops } => {
                if self.awaiting_resync.contains(&field_id) {
                    log::debug!("Dropping change for '{field_id}' while awaiting resync");
                    return;
                }
                match self.registry.apply_change(&field_id, &ops) {
                    Ok(()) => self.surface.apply_remote_change(&field_id, &ops),
                    Err(RegistryError::UnknownField(_)) => {
                        log::warn!("Change for unknown field '{field_id}' dropped");
                    }
                    Err(e) => self.force_resync(&field_id, e.to_string()).await,
                }
            }
            Message::RequestSnapshot => self.send_snapshot_sync().await,
            Message::SnapshotSync {
                document_id,
                section_id,
                fields,
            } => {
                if document_id != self.document_id || self.registry.section() != Some(section_id.as_str()) {
                    log::warn!("Ignoring sync for {document_id}/{section_id}");
                    return;
                }
                for field_id in self.registry.apply_snapshot(&fields) {
                    self.awaiting_resync.remove(&field_id);
                    if let Some(replica) = self.registry.get(&field_id) {
                        self.surface.replace_content(&field_id, replica.content());
                    }
                }
            }
            other => log::debug!("Ignoring client-bound '{}' message", other.message_type()),
        }
    }

    async fn send_snapshot_sync(&mut self) {
        let Some(section_id) = self.registry.section() else {
            log::debug!("Snapshot requested with no section open");
            return;
        };
        let sync = Message::snapshot_sync(&self.document_id, section_id, self.registry.snapshot_all());
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        if let Err(e) = channel.send(&sync).await {
            log::warn!("Snapshot sync not sent: {e}");
        }
    }

    /// Reset a diverged replica and ask the authority for fresh contents.
    async fn force_resync(&mut self, field_id: &str, reason: String) {
        log::warn!("Replica '{field_id}' out of sync ({reason}); resyncing");
        if let Some(replica) = self.registry.get_mut(field_id) {
            replica.reset();
        }
        self.awaiting_resync.insert(field_id.to_string());
        self.surface.replace_content(field_id, &Delta::new());

        let section = self.current_section().unwrap_or_default().to_string();
        self.notify(SessionNotice::ResyncForced {
            section: section.clone(),
            reason,
        });

        let rejoined = match self.channel.as_mut() {
            Some(channel) if channel.is_open() => channel
                .send(&Message::join(&self.document_id, &section))
                .await
                .is_ok(),
            _ => false,
        };
        if !rejoined {
            self.reopen_current().await;
        }
    }

    fn notify(&self, notice: SessionNotice) {
        if let Err(e) = self.notices.try_send(notice) {
            log::debug!("Notice dropped: {e}");
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Event loop
// ───────────────────────────────────────────────────────────────────

impl<C, K, A> SessionController<C, K, A>
where
    C: Connector + 'static,
    K: Catalog + 'static,
    A: AccessControl + 'static,
{
    /// Spawn the event loop and return a handle to it.
    pub fn start(self) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let task = tokio::spawn(self.run(command_rx));
        (SessionHandle { commands: command_tx }, task)
    }

    /// Process commands and inbound frames until teardown.
    ///
    /// Dropping every handle counts as teardown.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut deferred = VecDeque::new();

        loop {
            let command = match deferred.pop_front() {
                Some(command) => command,
                None => tokio::select! {
                    command = commands.recv() => match command {
                        Some(command) => command,
                        None => {
                            self.on_page_teardown().await;
                            break;
                        }
                    },
                    Some(event) = self.next_channel_event() => {
                        self.handle_channel_event(event).await;
                        continue;
                    }
                },
            };

            match command {
                Command::SwitchTo(section) => {
                    self.run_switch(section, &mut commands, &mut deferred).await;
                }
                Command::LocalChange { field_id, ops } => {
                    if let Err(e) = self.local_change(&field_id, ops).await {
                        log::warn!("Local change to '{field_id}' rejected: {e}");
                    }
                }
                Command::Reconnect => self.reconnect().await,
                Command::Teardown(done) => {
                    self.on_page_teardown().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        log::debug!("Session loop for '{}' finished", self.document_id);
    }

    /// Drive a switch while queueing commands that arrive meanwhile.
    ///
    /// Queued commands keep their arrival order, so an edit typed after a
    /// switch lands in the section it was typed in. Only a switch that
    /// directly follows another queued switch replaces it.
    async fn run_switch(
        &mut self,
        section: String,
        commands: &mut mpsc::Receiver<Command>,
        deferred: &mut VecDeque<Command>,
    ) {
        let switch = self.switch_to(&section);
        tokio::pin!(switch);
        loop {
            tokio::select! {
                biased;
                () = &mut switch => break,
                Some(command) = commands.recv() => Self::enqueue(deferred, command),
            }
        }
    }

    fn enqueue(deferred: &mut VecDeque<Command>, command: Command) {
        if let Command::SwitchTo(next) = &command {
            if let Some(Command::SwitchTo(pending)) = deferred.back_mut() {
                log::debug!("Switch to '{pending}' superseded by '{next}'");
                *pending = next.clone();
                return;
            }
        }
        deferred.push_back(command);
    }
}

impl<C, K, A> std::fmt::Debug for SessionController<C, K, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("document_id", &self.document_id)
            .field("state", &self.state)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::catalog::{SectionDescriptor, StaticAccessControl, StaticCatalog};
    use crate::registry::FieldSnapshot;
    use crate::transport::MemoryConnector;

    type Controller = SessionController<MemoryConnector, StaticCatalog, StaticAccessControl>;

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_document(
            "r1",
            vec![
                SectionDescriptor::new("Intro", ["Summary", "Scope"]),
                SectionDescriptor::new("Overview", ["Context"]),
                SectionDescriptor::new("Appendix", Vec::<String>::new()),
            ],
        )
    }

    fn controller(connector: &MemoryConnector) -> (Controller, mpsc::Receiver<SessionNotice>) {
        let config = SessionConfig {
            publish_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        SessionController::new(
            config,
            "r1",
            connector.clone(),
            catalog(),
            StaticAccessControl::new().with_admin("r1"),
        )
    }

    fn sent(connector: &MemoryConnector) -> Vec<Message> {
        connector.sent_messages().into_iter().map(|(_, m)| m).collect()
    }

    fn drain(notices: &mut mpsc::Receiver<SessionNotice>) -> Vec<SessionNotice> {
        let mut out = Vec::new();
        while let Ok(n) = notices.try_recv() {
            out.push(n);
        }
        out
    }

    /// Records every surface callback.
    #[derive(Clone, Default)]
    struct RecordingSurface(Arc<Mutex<Vec<String>>>);

    impl EditorSurface for RecordingSurface {
        fn section_mounted(&mut self, descriptor: &SectionDescriptor) {
            self.0.lock().unwrap().push(format!("mount {}", descriptor.title));
        }
        fn apply_remote_change(&mut self, field_id: &str, ops: &Delta) {
            self.0.lock().unwrap().push(format!("change {field_id} {}", ops.target_len()));
        }
        fn replace_content(&mut self, field_id: &str, content: &Delta) {
            self.0.lock().unwrap().push(format!("replace {field_id} {}", content.plain_text()));
        }
    }

    #[tokio::test]
    async fn test_open_section_builds_registry_and_joins() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);

        ctl.switch_to("Intro").await;

        assert_eq!(ctl.state(), &SessionState::SectionOpen { section: "Intro".into() });
        let ids: Vec<&str> = ctl.registry().field_ids().collect();
        assert_eq!(ids, vec!["Summary", "Scope"]);
        assert_eq!(ctl.channel_state(), Some(ChannelState::Open));
        assert_eq!(
            drain(&mut notices),
            vec![SessionNotice::SectionOpened {
                section: "Intro".into(),
                fields: vec!["Summary".into(), "Scope".into()],
            }]
        );
    }

    #[tokio::test]
    async fn test_local_edit_sends_exactly_one_change() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);
        ctl.switch_to("Intro").await;

        ctl.local_change("Summary", Delta::new().insert("Hi")).await.unwrap();
        ctl.on_page_teardown().await;

        let changes: Vec<Message> = sent(&connector)
            .into_iter()
            .filter(|m| matches!(m, Message::Change { .. }))
            .collect();
        assert_eq!(changes, vec![Message::change("Summary", Delta::new().insert("Hi"))]);
    }

    #[tokio::test]
    async fn test_current_ops_after_local_edit() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);
        ctl.switch_to("Intro").await;

        ctl.local_change("Summary", Delta::new().insert("Hi")).await.unwrap();
        let summary = ctl.registry().get("Summary").unwrap();
        assert_eq!(summary.current_ops(), Delta::new().insert("Hi"));
    }

    #[tokio::test]
    async fn test_switch_publishes_before_joining_next() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        ctl.local_change("Summary", Delta::new().insert("Hi")).await.unwrap();

        ctl.switch_to("Overview").await;

        let mut expected_fields = FieldSnapshot::new();
        expected_fields.insert("Summary".into(), Delta::new().insert("Hi"));
        expected_fields.insert("Scope".into(), Delta::new());

        let tail: Vec<(ChannelAddress, Message)> =
            connector.sent_messages().into_iter().skip(2).collect();
        assert_eq!(
            tail,
            vec![
                (
                    ChannelAddress::new("r1", "Intro"),
                    Message::snapshot_publish("r1", "Intro", expected_fields)
                ),
                (ChannelAddress::new("r1", "Intro"), Message::leave("Intro")),
                (ChannelAddress::new("r1", "Overview"), Message::join("r1", "Overview")),
            ]
        );
        assert!(connector.connections()[0].is_closed());
        let ids: Vec<&str> = ctl.registry().field_ids().collect();
        assert_eq!(ids, vec!["Context"]);
    }

    #[tokio::test]
    async fn test_switch_to_current_section_is_noop() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        ctl.switch_to("Intro").await;

        assert_eq!(connector.connections().len(), 1);
        assert_eq!(sent(&connector), vec![Message::join("r1", "Intro")]);
    }

    #[tokio::test]
    async fn test_request_snapshot_replies_with_all_fields() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        ctl.local_change("Scope", Delta::new().insert("All")).await.unwrap();

        ctl.handle_channel_event(ChannelEvent::Message(Message::RequestSnapshot)).await;
        ctl.on_page_teardown().await;

        let sync = sent(&connector)
            .into_iter()
            .find_map(|m| match m {
                Message::SnapshotSync { fields, .. } => Some(fields),
                _ => None,
            })
            .unwrap();
        let ids: Vec<&str> = sync.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["Summary", "Scope"]);
        assert_eq!(sync["Scope"], Delta::new().insert("All"));
    }

    #[tokio::test]
    async fn test_teardown_publishes_then_leaves() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        drain(&mut notices);

        ctl.on_page_teardown().await;

        let messages = sent(&connector);
        assert!(matches!(messages[1], Message::SnapshotPublish { .. }));
        assert_eq!(messages[2], Message::leave("Intro"));
        assert_eq!(messages.len(), 3);
        assert!(connector.last_connection().unwrap().is_closed());
        assert_eq!(ctl.state(), &SessionState::TornDown);
        assert_eq!(drain(&mut notices), vec![SessionNotice::TornDown]);
    }

    #[tokio::test]
    async fn test_malformed_delta_keeps_channel_open() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        drain(&mut notices);

        connector
            .last_connection()
            .unwrap()
            .inject(br#"{"type":"delta"}"#.to_vec())
            .await
            .unwrap();
        let event = ctl.next_channel_event().await.unwrap();
        ctl.handle_channel_event(event).await;

        assert_eq!(ctl.channel_state(), Some(ChannelState::Open));
        assert!(ctl.registry().iter().all(|(_, r)| r.is_empty()));
        assert!(matches!(
            drain(&mut notices).as_slice(),
            [SessionNotice::ProtocolError { error: ProtocolError::Malformed(_) }]
        ));
    }

    #[tokio::test]
    async fn test_remote_change_reaches_surface() {
        let connector = MemoryConnector::new();
        let surface = RecordingSurface::default();
        let (ctl, _notices) = controller(&connector);
        let mut ctl = ctl.with_surface(surface.clone());
        ctl.switch_to("Intro").await;

        ctl.handle_channel_event(ChannelEvent::Message(Message::change(
            "Summary",
            Delta::new().insert("abc"),
        )))
        .await;
        ctl.handle_channel_event(ChannelEvent::Message(Message::change(
            "Nope",
            Delta::new().insert("x"),
        )))
        .await;

        assert_eq!(ctl.registry().get("Summary").unwrap().len(), 3);
        assert_eq!(
            *surface.0.lock().unwrap(),
            vec!["mount Intro".to_string(), "change Summary 3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_change_forces_resync() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        ctl.local_change("Summary", Delta::new().insert("ab")).await.unwrap();
        drain(&mut notices);

        ctl.handle_channel_event(ChannelEvent::Message(Message::change(
            "Summary",
            Delta::new().retain(10).insert("x"),
        )))
        .await;

        assert!(ctl.registry().get("Summary").unwrap().is_empty());
        assert!(matches!(
            drain(&mut notices).as_slice(),
            [SessionNotice::ResyncForced { .. }]
        ));
        ctl.on_page_teardown().await;
        let joins = sent(&connector)
            .into_iter()
            .filter(|m| matches!(m, Message::Join { .. }))
            .count();
        assert_eq!(joins, 2);
    }

    #[tokio::test]
    async fn test_inbound_sync_replaces_fields() {
        let connector = MemoryConnector::new();
        let surface = RecordingSurface::default();
        let (ctl, _notices) = controller(&connector);
        let mut ctl = ctl.with_surface(surface.clone());
        ctl.switch_to("Intro").await;
        ctl.local_change("Summary", Delta::new().insert("old")).await.unwrap();

        let mut fields = FieldSnapshot::new();
        fields.insert("Summary".into(), Delta::new().insert("new"));
        ctl.handle_channel_event(ChannelEvent::Message(Message::snapshot_sync("r1", "Intro", fields)))
            .await;

        assert_eq!(ctl.registry().get("Summary").unwrap().content().plain_text(), "new");
        assert!(surface.0.lock().unwrap().contains(&"replace Summary new".to_string()));
    }

    #[tokio::test]
    async fn test_settings_opens_without_channel() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        drain(&mut notices);

        ctl.switch_to(SETTINGS_SECTION).await;

        assert_eq!(ctl.state(), &SessionState::Settings);
        assert!(ctl.registry().is_empty());
        assert_eq!(ctl.channel_state(), None);
        assert_eq!(connector.connections().len(), 1);
        assert_eq!(drain(&mut notices), vec![SessionNotice::SettingsOpened { is_admin: true }]);

        ctl.switch_to("Overview").await;
        let last = sent(&connector).pop().unwrap();
        assert_eq!(last, Message::join("r1", "Overview"));
    }

    #[tokio::test]
    async fn test_unknown_section_goes_to_no_section() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);

        ctl.switch_to("Missing").await;

        assert_eq!(ctl.state(), &SessionState::NoSection);
        assert!(connector.connections().is_empty());
        assert_eq!(
            drain(&mut notices),
            vec![SessionNotice::SectionNotFound { section: "Missing".into() }]
        );
    }

    #[tokio::test]
    async fn test_section_without_subsections_has_no_channel() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);

        ctl.switch_to("Appendix").await;

        assert_eq!(ctl.state(), &SessionState::SectionOpen { section: "Appendix".into() });
        assert!(ctl.registry().is_empty());
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_then_reconnect() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        drain(&mut notices);

        connector.last_connection().unwrap().fail("reset").await.unwrap();
        let event = ctl.next_channel_event().await.unwrap();
        ctl.handle_channel_event(event).await;

        assert_eq!(ctl.channel_state(), None);
        assert_eq!(
            drain(&mut notices),
            vec![SessionNotice::TransportFailed {
                section: "Intro".into(),
                reason: "reset".into(),
            }]
        );
        assert!(ctl.local_change("Summary", Delta::new().insert("x")).await.is_ok());

        ctl.reconnect().await;
        assert_eq!(ctl.channel_state(), Some(ChannelState::Open));
        assert_eq!(connector.connections().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_still_opens_section() {
        let connector = MemoryConnector::new();
        connector.refuse_connections(true);
        let (mut ctl, mut notices) = controller(&connector);

        ctl.switch_to("Intro").await;

        assert_eq!(ctl.state(), &SessionState::SectionOpen { section: "Intro".into() });
        assert_eq!(ctl.channel_state(), None);
        let notices = drain(&mut notices);
        assert!(matches!(notices[0], SessionNotice::TransportFailed { .. }));
    }

    #[tokio::test]
    async fn test_publish_timeout_does_not_block_switch() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        drain(&mut notices);

        connector.stall_shutdown(true);
        ctl.switch_to("Overview").await;

        assert_eq!(ctl.state(), &SessionState::SectionOpen { section: "Overview".into() });
        let notices = drain(&mut notices);
        assert_eq!(notices[0], SessionNotice::PublishTimeout { section: "Intro".into() });
    }

    #[tokio::test]
    async fn test_switch_is_bounded_when_writer_stalls() {
        let connector = MemoryConnector::new();
        let (mut ctl, mut notices) = controller(&connector);
        ctl.switch_to("Intro").await;
        drain(&mut notices);

        connector.stall_writes(true);
        for i in 0..300 {
            ctl.local_change("Summary", Delta::new().retain(i).insert("a")).await.unwrap();
        }

        let switching = ctl.switch_to("Overview");
        tokio::time::timeout(Duration::from_secs(2), switching)
            .await
            .expect("switch hung on a stalled writer");

        assert_eq!(ctl.state(), &SessionState::SectionOpen { section: "Overview".into() });
        assert!(drain(&mut notices).contains(&SessionNotice::PublishTimeout {
            section: "Intro".into()
        }));
    }

    #[tokio::test]
    async fn test_local_change_without_section_is_rejected() {
        let connector = MemoryConnector::new();
        let (mut ctl, _notices) = controller(&connector);
        let result = ctl.local_change("Summary", Delta::new().insert("x")).await;
        assert!(matches!(result, Err(SessionError::NoSection)));
    }

    #[tokio::test]
    async fn test_run_loop_coalesces_switches() {
        let connector = MemoryConnector::new();
        let (ctl, mut notices) = controller(&connector);
        let (handle, task) = ctl.start();

        handle.switch_to("Intro").await.unwrap();
        assert!(matches!(notices.recv().await, Some(SessionNotice::SectionOpened { .. })));

        connector.stall_shutdown(true);
        handle.switch_to("Overview").await.unwrap();
        handle.switch_to("Appendix").await.unwrap();
        handle.switch_to("Intro").await.unwrap();
        handle.local_change("Summary", Delta::new().insert("z")).await.unwrap();
        handle.teardown().await.unwrap();
        task.await.unwrap();

        let joins: Vec<String> = sent(&connector)
            .into_iter()
            .filter_map(|m| match m {
                Message::Join { section_id, .. } => Some(section_id),
                _ => None,
            })
            .collect();
        assert_eq!(joins, vec!["Intro", "Overview", "Intro"]);
        assert!(sent(&connector).contains(&Message::change("Summary", Delta::new().insert("z"))));
    }

    #[tokio::test]
    async fn test_edit_during_switch_stays_in_its_section() {
        let connector = MemoryConnector::new();
        let (ctl, mut notices) = controller(&connector);
        let (handle, task) = ctl.start();

        handle.switch_to("Intro").await.unwrap();
        assert!(matches!(notices.recv().await, Some(SessionNotice::SectionOpened { .. })));

        connector.stall_shutdown(true);
        handle.switch_to("Overview").await.unwrap();
        handle
            .local_change("Context", Delta::new().insert("typed in Overview"))
            .await
            .unwrap();
        handle.switch_to("Intro").await.unwrap();
        handle.teardown().await.unwrap();
        task.await.unwrap();

        let messages = sent(&connector);
        assert!(messages.contains(&Message::change(
            "Context",
            Delta::new().insert("typed in Overview")
        )));
        let published = messages.iter().find_map(|m| match m {
            Message::SnapshotPublish { section_id, fields, .. } if section_id == "Overview" => {
                Some(fields.clone())
            }
            _ => None,
        });
        let published = published.expect("Overview was never published");
        assert_eq!(published["Context"].plain_text(), "typed in Overview");

        let joins: Vec<String> = messages
            .into_iter()
            .filter_map(|m| match m {
                Message::Join { section_id, .. } => Some(section_id),
                _ => None,
            })
            .collect();
        assert_eq!(joins, vec!["Intro", "Overview", "Intro"]);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_controller() {
        let connector = MemoryConnector::new();
        let (ctl, _notices) = controller(&connector);
        let (handle, task) = ctl.start();
        handle.teardown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(handle.switch_to("Intro").await, Err(SessionError::Stopped)));
    }
}
