//! The message handle handed to handlers.
//!
//! Dispositions are routed back to the Reader's controller task over a
//! thread-safe channel, so a `Message` may be stashed and responded to from
//! any task or thread. Each message accepts exactly one terminal response;
//! duplicates are a handler bug and are dropped with a warning.
use bytes::Bytes;
use nsq_wire::{MessageBody, MessageId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::conn::ConnId;

/// Outcome of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark the message processed (FIN).
    Finish,
    /// Give the message back to the broker (REQ). `delay: None` derives the
    /// delay from the attempt count; `backoff: true` counts the failure
    /// against the Reader's backoff state.
    Requeue {
        delay: Option<Duration>,
        backoff: bool,
    },
    /// Respond later through the message itself (async mode).
    Defer,
}

/// A terminal or visibility action requested on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseAction {
    Finish,
    Requeue {
        delay: Option<Duration>,
        backoff: bool,
    },
    Touch,
}

/// Routed from a `Message` back to the controller that owns the connection.
#[derive(Debug)]
pub(crate) struct ResponseEvent {
    pub conn: ConnId,
    pub id: MessageId,
    pub attempts: u16,
    pub action: ResponseAction,
}

/// A message received from the broker.
#[derive(Clone)]
pub struct Message {
    id: MessageId,
    body: Bytes,
    timestamp: i64,
    attempts: u16,
    conn: ConnId,
    responded: Arc<AtomicBool>,
    async_enabled: Arc<AtomicBool>,
    responses: mpsc::UnboundedSender<ResponseEvent>,
}

impl Message {
    pub(crate) fn new(
        body: MessageBody,
        conn: ConnId,
        responses: mpsc::UnboundedSender<ResponseEvent>,
    ) -> Self {
        Self {
            id: body.id,
            body: body.body,
            timestamp: body.timestamp,
            attempts: body.attempts,
            conn,
            responded: Arc::new(AtomicBool::new(false)),
            async_enabled: Arc::new(AtomicBool::new(false)),
            responses,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Mutable body access for `preprocess` hooks.
    pub fn body_mut(&mut self) -> &mut Bytes {
        &mut self.body
    }

    /// Production time in nanoseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Number of deliveries, this one included.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// The endpoint this message arrived on.
    pub fn endpoint(&self) -> &str {
        &self.conn
    }

    /// Opt into async processing: the Reader will not respond automatically
    /// when the handler returns.
    pub fn enable_async(&self) {
        self.async_enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_async(&self) -> bool {
        self.async_enabled.load(Ordering::Relaxed)
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Relaxed)
    }

    /// Tell the broker the message was processed.
    pub fn finish(&self) {
        self.respond(ResponseAction::Finish);
    }

    /// Give the message back for redelivery.
    pub fn requeue(&self, delay: Option<Duration>, backoff: bool) {
        self.respond(ResponseAction::Requeue { delay, backoff });
    }

    /// Extend the broker-side visibility timeout. May be called repeatedly
    /// before the terminal response.
    pub fn touch(&self) {
        if self.has_responded() {
            warn!(id = %self.id, "TOUCH after terminal response, dropping");
            return;
        }
        self.send(ResponseAction::Touch);
    }

    fn respond(&self, action: ResponseAction) {
        if self.responded.swap(true, Ordering::AcqRel) {
            warn!(id = %self.id, "duplicate response for message, dropping");
            return;
        }
        self.send(action);
    }

    fn send(&self, action: ResponseAction) {
        // A send error means the Reader is gone; the broker will time the
        // message out server-side.
        let _ = self.responses.send(ResponseEvent {
            conn: self.conn.clone(),
            id: self.id,
            attempts: self.attempts,
            action,
        });
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("conn", &self.conn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message() -> (Message, mpsc::UnboundedReceiver<ResponseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = MessageBody {
            timestamp: 1,
            attempts: 3,
            id: MessageId::from_bytes(b"0123456789abcdef").expect("id"),
            body: Bytes::from_static(b"payload"),
        };
        (Message::new(body, ConnId::from("127.0.0.1:4150"), tx), rx)
    }

    #[test]
    fn finish_emits_one_event() {
        let (msg, mut rx) = test_message();
        msg.finish();
        let event = rx.try_recv().expect("event");
        assert_eq!(event.action, ResponseAction::Finish);
        assert_eq!(event.attempts, 3);
        assert!(msg.has_responded());
    }

    #[test]
    fn second_response_is_dropped() {
        let (msg, mut rx) = test_message();
        msg.finish();
        msg.finish();
        msg.requeue(None, true);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_the_response_guard() {
        let (msg, mut rx) = test_message();
        let stashed = msg.clone();
        msg.finish();
        stashed.finish();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(stashed.has_responded());
    }

    #[test]
    fn touch_does_not_consume_the_response() {
        let (msg, mut rx) = test_message();
        msg.touch();
        msg.touch();
        msg.finish();
        let actions: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                ResponseAction::Touch,
                ResponseAction::Touch,
                ResponseAction::Finish
            ]
        );
    }

    #[test]
    fn touch_after_finish_is_dropped() {
        let (msg, mut rx) = test_message();
        msg.finish();
        msg.touch();
        assert_eq!(rx.try_recv().expect("fin").action, ResponseAction::Finish);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn async_flag_is_shared_with_clones() {
        let (msg, _rx) = test_message();
        assert!(!msg.is_async());
        let clone = msg.clone();
        clone.enable_async();
        assert!(msg.is_async());
    }
}
