//! The Writer: a high-level NSQ producer.
//!
//! Maintains one connection per configured nsqd; each publish picks a
//! random live connection and awaits the broker's response, correlated
//! FIFO per connection. Lost connections fail their queued publishes and
//! reconnect on a fixed schedule.
use bytes::Bytes;
use nsq_wire::{Command, OK};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Config, RECONNECT_BASE};
use crate::conn::{self, ConnCommand, ConnEvent, ConnHandle, ConnId};
use crate::error::{Error, Result};

enum WriterEvent {
    Publish {
        command: Command,
        ack: oneshot::Sender<Result<()>>,
    },
    Reconnect { addr: String },
    Close(oneshot::Sender<()>),
}

/// Handle to a running producer.
pub struct Writer {
    api_tx: mpsc::UnboundedSender<WriterEvent>,
}

impl Writer {
    /// Validate the configuration and start the producer. Must be called
    /// within a tokio runtime.
    pub fn new<I, S>(nsqd_tcp_addresses: I, config: Config) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        let addresses: Vec<String> = nsqd_tcp_addresses.into_iter().map(Into::into).collect();
        if addresses.is_empty() {
            return Err(Error::Config(
                "at least one nsqd address is required".into(),
            ));
        }

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (api_tx, api_rx) = mpsc::unbounded_channel();
        info!(?addresses, "starting writer");
        let controller = WriterController {
            config: Arc::new(config),
            addresses,
            conn_tx,
            api_tx: api_tx.clone(),
            conns: HashMap::new(),
            waiting: VecDeque::new(),
            closing: false,
            close_acks: Vec::new(),
        };
        tokio::spawn(controller.run(conn_rx, api_rx));
        Ok(Self { api_tx })
    }

    /// Publish one message.
    pub async fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        self.send_command(Command::Publish {
            topic: valid_topic(topic)?,
            body: body.into(),
        })
        .await
    }

    /// Publish a batch atomically.
    pub async fn multi_publish<I, B>(&self, topic: &str, bodies: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.send_command(Command::MultiPublish {
            topic: valid_topic(topic)?,
            bodies: bodies.into_iter().map(Into::into).collect(),
        })
        .await
    }

    /// Publish with broker-side delivery delay.
    pub async fn deferred_publish(
        &self,
        topic: &str,
        delay: Duration,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.send_command(Command::DeferredPublish {
            topic: valid_topic(topic)?,
            delay_ms: delay.as_millis() as u64,
            body: body.into(),
        })
        .await
    }

    /// Tear down every connection. Queued publishes fail with a
    /// connection error.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.api_tx.send(WriterEvent::Close(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        let (ack, response) = oneshot::channel();
        self.api_tx
            .send(WriterEvent::Publish { command, ack })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }
}

fn valid_topic(topic: &str) -> Result<String> {
    if !nsq_wire::valid_topic_name(topic) {
        return Err(Error::Protocol(nsq_wire::Error::InvalidTopic(
            topic.to_string(),
        )));
    }
    Ok(topic.to_string())
}

struct WriterConnState {
    handle: ConnHandle,
    ready: bool,
    pending: VecDeque<oneshot::Sender<Result<()>>>,
}

struct WriterController {
    config: Arc<Config>,
    addresses: Vec<String>,
    conn_tx: mpsc::UnboundedSender<(ConnId, ConnEvent)>,
    api_tx: mpsc::UnboundedSender<WriterEvent>,
    conns: HashMap<ConnId, WriterConnState>,
    /// Publishes issued while every connection is still establishing.
    waiting: VecDeque<(Command, oneshot::Sender<Result<()>>)>,
    closing: bool,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl WriterController {
    async fn run(
        mut self,
        mut conn_rx: mpsc::UnboundedReceiver<(ConnId, ConnEvent)>,
        mut api_rx: mpsc::UnboundedReceiver<WriterEvent>,
    ) {
        let addresses = self.addresses.clone();
        for addr in &addresses {
            self.connect(addr);
        }
        loop {
            tokio::select! {
                Some((id, event)) = conn_rx.recv() => self.on_conn_event(id, event),
                Some(event) = api_rx.recv() => self.on_api_event(event),
            }
            if self.closing && self.conns.is_empty() {
                for ack in self.close_acks.drain(..) {
                    let _ = ack.send(());
                }
                info!("writer closed");
                return;
            }
        }
    }

    fn connect(&mut self, addr: &str) {
        if self.closing || self.conns.contains_key(addr) {
            return;
        }
        info!(addr, "connecting to nsqd");
        let handle = conn::spawn(addr, None, self.config.clone(), self.conn_tx.clone());
        self.conns.insert(
            handle.id.clone(),
            WriterConnState {
                handle,
                ready: false,
                pending: VecDeque::new(),
            },
        );
    }

    fn on_conn_event(&mut self, id: ConnId, event: ConnEvent) {
        match event {
            ConnEvent::Ready { identify } => {
                info!(conn = %id, version = %identify.version, "connected");
                if let Some(state) = self.conns.get_mut(&id) {
                    state.ready = true;
                    // Publishes queued before any connection came up go out
                    // on the first one that does.
                    for (command, ack) in self.waiting.drain(..) {
                        state.pending.push_back(ack);
                        state.handle.send(ConnCommand::Send(command));
                    }
                }
            }
            ConnEvent::Response(data) => {
                if data.as_ref() != OK {
                    debug!(conn = %id, response = %String::from_utf8_lossy(&data), "response");
                }
                if let Some(state) = self.conns.get_mut(&id)
                    && let Some(ack) = state.pending.pop_front()
                {
                    let _ = ack.send(Ok(()));
                }
            }
            ConnEvent::BrokerError(data) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                if let Some(state) = self.conns.get_mut(&id)
                    && let Some(ack) = state.pending.pop_front()
                {
                    let _ = ack.send(Err(Error::Broker(text)));
                }
            }
            ConnEvent::Heartbeat => debug!(conn = %id, "heartbeat"),
            ConnEvent::Message(body) => {
                // Producers are not subscribed; this is a broker bug.
                warn!(conn = %id, id = %body.id, "unexpected message frame on writer connection");
            }
            ConnEvent::Closed { error } => self.on_conn_closed(id, error),
        }
    }

    fn on_conn_closed(&mut self, id: ConnId, error: Option<Error>) {
        let Some(mut state) = self.conns.remove(&id) else {
            return;
        };
        let reason = match &error {
            Some(e) => {
                warn!(conn = %id, error = %e, "connection closed");
                e.to_string()
            }
            None => {
                info!(conn = %id, "connection closed");
                Error::ClosedByPeer.to_string()
            }
        };
        for ack in state.pending.drain(..) {
            let _ = ack.send(Err(Error::ConnectionLost(reason.clone())));
        }
        if self.conns.is_empty() {
            for (_, ack) in self.waiting.drain(..) {
                let _ = ack.send(Err(Error::NoConnections));
            }
        }
        if self.closing {
            return;
        }
        info!(conn = %id, delay = ?RECONNECT_BASE, "reconnecting after delay");
        let api = self.api_tx.clone();
        let addr = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_BASE).await;
            let _ = api.send(WriterEvent::Reconnect { addr });
        });
    }

    fn on_api_event(&mut self, event: WriterEvent) {
        match event {
            WriterEvent::Publish { command, ack } => {
                if self.closing {
                    let _ = ack.send(Err(Error::NoConnections));
                    return;
                }
                let ready: Vec<ConnId> = self
                    .conns
                    .iter()
                    .filter(|(_, s)| s.ready)
                    .map(|(id, _)| id.clone())
                    .collect();
                if ready.is_empty() {
                    if self.conns.is_empty() {
                        let _ = ack.send(Err(Error::NoConnections));
                    } else {
                        // Connections are still establishing; hold the
                        // publish for the first Ready.
                        self.waiting.push_back((command, ack));
                    }
                    return;
                }
                let pick = &ready[rand::random_range(0..ready.len())];
                if let Some(state) = self.conns.get_mut(pick) {
                    state.pending.push_back(ack);
                    state.handle.send(ConnCommand::Send(command));
                }
            }
            WriterEvent::Reconnect { addr } => {
                if !self.closing {
                    self.connect(&addr);
                }
            }
            WriterEvent::Close(ack) => {
                self.close_acks.push(ack);
                if self.closing {
                    return;
                }
                self.closing = true;
                info!("closing writer");
                for (_, ack) in self.waiting.drain(..) {
                    let _ = ack.send(Err(Error::NoConnections));
                }
                for state in self.conns.values() {
                    state.handle.send(ConnCommand::HardClose);
                }
            }
        }
    }
}
