//! Per-connection actor.
//!
//! # Purpose
//! One task per broker connection: it performs the handshake, then loops
//! over received frames, queued commands, and the heartbeat deadline. All
//! connection-level protocol state lives here; RDY accounting and backoff
//! live in the controller that owns the actor.
//!
//! # Design notes
//! The actor only parses frames and forwards events; it never mutates
//! Reader state. Commands arrive over an unbounded channel so dispositions
//! issued from user threads cannot block.
use nsq_wire::{Command, Frame, FrameType, MessageBody};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{Config, IdentifyResponse};
use crate::error::{Error, Result};

mod handshake;
mod io;

/// Endpoint address (`host:port`), doubling as the connection key.
pub(crate) type ConnId = Arc<str>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// Subscribed and ready for RDY.
    Ready { identify: IdentifyResponse },
    Message(MessageBody),
    Response(bytes::Bytes),
    /// A transient server error frame (fatal ones close the connection).
    BrokerError(bytes::Bytes),
    Heartbeat,
    /// Terminal; the actor exits right after emitting this.
    Closed { error: Option<Error> },
}

#[derive(Debug)]
pub(crate) enum ConnCommand {
    Send(Command),
    /// Begin a graceful close: send CLS and treat the eventual EOF as clean.
    Cls,
    /// Drop the socket immediately.
    HardClose,
}

pub(crate) struct ConnHandle {
    pub(crate) id: ConnId,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
}

impl ConnHandle {
    pub(crate) fn send(&self, command: ConnCommand) {
        // The actor draining late means the command is moot anyway.
        let _ = self.cmd_tx.send(command);
    }
}

/// Spawn the actor for one broker connection. `subscription` is `Some` for
/// consumers and `None` for producers.
pub(crate) fn spawn(
    addr: &str,
    subscription: Option<(String, String)>,
    config: Arc<Config>,
    events: mpsc::UnboundedSender<(ConnId, ConnEvent)>,
) -> ConnHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let id: ConnId = Arc::from(addr);
    let actor = ConnActor {
        id: id.clone(),
        config,
        subscription,
        events,
        cmd_rx,
    };
    tokio::spawn(actor.run());
    ConnHandle { id, cmd_tx }
}

struct ConnActor {
    id: ConnId,
    config: Arc<Config>,
    subscription: Option<(String, String)>,
    events: mpsc::UnboundedSender<(ConnId, ConnEvent)>,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
}

impl ConnActor {
    async fn run(mut self) {
        let error = match self.run_io().await {
            Ok(()) => None,
            Err(e) => Some(e),
        };
        let _ = self
            .events
            .send((self.id.clone(), ConnEvent::Closed { error }));
    }

    async fn run_io(&mut self) -> Result<()> {
        let negotiated = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake::establish(&self.id, &self.config, self.subscription.as_ref()),
        )
        .await
        .map_err(|_| {
            Error::integrity("handshake", format!("no completion within {HANDSHAKE_TIMEOUT:?}"))
        })??;
        let handshake::Negotiated { mut io, identify } = negotiated;

        if self
            .events
            .send((self.id.clone(), ConnEvent::Ready { identify }))
            .is_err()
        {
            // Owner is gone; nothing to serve.
            return Ok(());
        }

        let heartbeat_window = self.config.heartbeat_interval.map(|i| i * 2);
        let mut deadline = heartbeat_window.map(|w| Instant::now() + w);
        let mut closing = false;

        loop {
            let heartbeat_check = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                frame = io.read_frame() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(Error::ClosedByPeer) if closing => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    deadline = heartbeat_window.map(|w| Instant::now() + w);
                    self.dispatch_frame(&mut io, frame).await?;
                    if self.events.is_closed() {
                        // Owner is gone; stop serving the socket.
                        return Ok(());
                    }
                }
                command = self.cmd_rx.recv() => match command {
                    Some(ConnCommand::Send(command)) => {
                        io.send_command(&command).await?;
                    }
                    Some(ConnCommand::Cls) => {
                        closing = true;
                        io.send_command(&Command::Cls).await?;
                    }
                    Some(ConnCommand::HardClose) | None => return Ok(()),
                },
                _ = heartbeat_check => {
                    return Err(Error::HeartbeatTimeout(
                        heartbeat_window.unwrap_or_default(),
                    ));
                }
            }
        }
    }

    async fn dispatch_frame(&mut self, io: &mut io::ConnIo, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::Response if frame.is_heartbeat() => {
                io.send_command(&Command::Nop).await?;
                let _ = self.events.send((self.id.clone(), ConnEvent::Heartbeat));
            }
            FrameType::Response => {
                debug!(conn = %self.id, response = %String::from_utf8_lossy(&frame.payload), "response");
                let _ = self
                    .events
                    .send((self.id.clone(), ConnEvent::Response(frame.payload)));
            }
            FrameType::Error => {
                if is_transient_error(&frame.payload) {
                    warn!(conn = %self.id, error = %String::from_utf8_lossy(&frame.payload), "broker error");
                    let _ = self
                        .events
                        .send((self.id.clone(), ConnEvent::BrokerError(frame.payload)));
                } else {
                    return Err(Error::Broker(
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    ));
                }
            }
            FrameType::Message => {
                let body = MessageBody::decode(frame.payload)?;
                let _ = self
                    .events
                    .send((self.id.clone(), ConnEvent::Message(body)));
            }
        }
        Ok(())
    }
}

/// Errors the broker reports without invalidating the connection.
fn is_transient_error(payload: &[u8]) -> bool {
    payload.starts_with(b"E_FIN_FAILED")
        || payload.starts_with(b"E_REQ_FAILED")
        || payload.starts_with(b"E_TOUCH_FAILED")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_do_not_close() {
        assert!(is_transient_error(b"E_FIN_FAILED FIN failed"));
        assert!(is_transient_error(b"E_REQ_FAILED REQ failed"));
        assert!(is_transient_error(b"E_TOUCH_FAILED TOUCH failed"));
        assert!(!is_transient_error(b"E_INVALID bad command"));
        assert!(!is_transient_error(b"E_BAD_TOPIC topic unknown"));
        assert!(!is_transient_error(b"E_AUTH_FAILED denied"));
    }
}
