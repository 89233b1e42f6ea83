//! Session channel: one bidirectional message stream bound to a section.
//!
//! ```text
//!  Connecting ──connect──▸ Open ──close()──▸ Closing ──ack / timeout──▸ Closed
//!       │                   │                   │
//!       └───────────────────┴─── transport error ┴──▸ Failed
//! ```
//!
//! Outbound messages are queued FIFO on the transport link. A full queue
//! rejects the message instead of waiting on a stalled writer. `close()`
//! queues `Leave` behind whatever is already waiting and blocks (bounded,
//! enqueue included) until the writer has drained the queue and shut the
//! transport down.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::address::ChannelAddress;
use crate::protocol::{Message, ProtocolError};
use crate::transport::{Connector, Outbound, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

/// What the channel surfaces to its owner on receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Message),
    /// An undecodable frame was dropped; the channel stays open.
    ProtocolError(ProtocolError),
    /// Too many consecutive undecodable frames.
    ProtocolErrorLimit(ProtocolError),
    /// The transport broke; the channel is now `Failed`.
    Failed(String),
    /// The authority closed the connection.
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel is {0:?}; message dropped")]
    NotOpen(ChannelState),

    #[error("outbound queue is full; message dropped")]
    QueueFull,

    #[error("close did not complete within {0:?}")]
    CloseTimeout(Duration),
}

pub struct SessionChannel {
    address: ChannelAddress,
    state: ChannelState,
    outbound: Option<mpsc::Sender<Outbound>>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    protocol_errors: u32,
    max_protocol_errors: u32,
}

impl SessionChannel {
    pub fn new(address: ChannelAddress, max_protocol_errors: u32) -> Self {
        Self {
            address,
            state: ChannelState::Connecting,
            outbound: None,
            inbound: None,
            protocol_errors: 0,
            max_protocol_errors: max_protocol_errors.max(1),
        }
    }

    /// Create a channel and connect it in one step.
    pub async fn open<C: Connector>(
        connector: &C,
        address: ChannelAddress,
        max_protocol_errors: u32,
    ) -> Result<Self, ChannelError> {
        let mut channel = Self::new(address, max_protocol_errors);
        channel.connect(connector).await?;
        Ok(channel)
    }

    /// Connect the transport and announce this client with `Join`.
    pub async fn connect<C: Connector>(&mut self, connector: &C) -> Result<(), ChannelError> {
        if self.state != ChannelState::Connecting {
            return Err(ChannelError::NotOpen(self.state));
        }

        let link = match connector.connect(&self.address).await {
            Ok(link) => link,
            Err(e) => {
                log::error!("Channel {} failed to connect: {e}", self.address);
                self.state = ChannelState::Failed;
                return Err(e.into());
            }
        };

        self.outbound = Some(link.outbound);
        self.inbound = Some(link.inbound);
        self.state = ChannelState::Open;
        log::info!("Channel {} open", self.address);

        let join = Message::join(&self.address.document_id, &self.address.section_id);
        self.send(&join).await
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Queue a message. Only valid while `Open`; never waits on the writer.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        if self.state != ChannelState::Open {
            log::warn!(
                "Dropping {} on channel {} ({:?})",
                msg.message_type(),
                self.address,
                self.state
            );
            return Err(ChannelError::NotOpen(self.state));
        }
        let bytes = msg.encode()?;
        let Some(outbound) = self.outbound.as_ref() else {
            return Err(ChannelError::NotOpen(self.state));
        };
        match outbound.try_send(Outbound::Frame(bytes)) {
            Ok(()) => {
                log::trace!("Queued {} on {}", msg.message_type(), self.address);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Outbound queue of {} is full; dropping {}",
                    self.address,
                    msg.message_type()
                );
                Err(ChannelError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                log::error!("Channel {} writer is gone", self.address);
                self.fail();
                Err(TransportError::ConnectionClosed.into())
            }
        }
    }

    /// Next inbound event, or `None` once the channel has no transport.
    ///
    /// Cancel-safe: the only suspension point is the inbound queue.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let inbound = self.inbound.as_mut()?;
        let event = match inbound.recv().await {
            Some(TransportEvent::Frame(bytes)) => match Message::decode(&bytes) {
                Ok(msg) => {
                    self.protocol_errors = 0;
                    ChannelEvent::Message(msg)
                }
                Err(e) => {
                    self.protocol_errors += 1;
                    log::warn!(
                        "Undecodable frame on {} ({}/{}): {e}",
                        self.address,
                        self.protocol_errors,
                        self.max_protocol_errors
                    );
                    if self.protocol_errors >= self.max_protocol_errors {
                        self.protocol_errors = 0;
                        ChannelEvent::ProtocolErrorLimit(e)
                    } else {
                        ChannelEvent::ProtocolError(e)
                    }
                }
            },
            Some(TransportEvent::Closed) => {
                log::info!("Channel {} closed by remote", self.address);
                self.state = ChannelState::Closed;
                self.outbound = None;
                self.inbound = None;
                ChannelEvent::Closed
            }
            Some(TransportEvent::Error(reason)) => {
                log::error!("Channel {} transport error: {reason}", self.address);
                self.fail();
                ChannelEvent::Failed(reason)
            }
            None => {
                self.fail();
                ChannelEvent::Failed("transport ended".to_string())
            }
        };
        Some(event)
    }

    /// Queue `Leave`, drain everything queued, and shut the transport down.
    ///
    /// Waits at most `timeout` in total, queueing the shutdown included.
    /// The channel ends `Closed` either way.
    pub async fn close(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Closed | ChannelState::Closing => return Ok(()),
            ChannelState::Failed | ChannelState::Connecting => {
                self.state = ChannelState::Closed;
                self.outbound = None;
                self.inbound = None;
                return Ok(());
            }
            ChannelState::Open => {}
        }

        let leave = Message::leave(&self.address.section_id);
        if let Err(e) = self.send(&leave).await {
            log::debug!("Leave not sent on {}: {e}", self.address);
        }
        self.state = ChannelState::Closing;

        let result = match self.outbound.take() {
            Some(outbound) => {
                let drain = async move {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if outbound.send(Outbound::Shutdown(ack_tx)).await.is_ok() {
                        let _ = ack_rx.await;
                    }
                };
                match tokio::time::timeout(timeout, drain).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        log::warn!("Channel {} drain timed out after {timeout:?}", self.address);
                        Err(ChannelError::CloseTimeout(timeout))
                    }
                }
            }
            None => Ok(()),
        };

        self.inbound = None;
        self.state = ChannelState::Closed;
        log::info!("Channel {} closed", self.address);
        result
    }

    fn fail(&mut self) {
        self.state = ChannelState::Failed;
        self.outbound = None;
        self.inbound = None;
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("address", &self.address)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
