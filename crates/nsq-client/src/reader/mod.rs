//! The Reader: a high-level NSQ consumer.
//!
//! # Purpose
//! Consumes one topic/channel across every broker that hosts it, spreading
//! the global `max_in_flight` budget over the connection fleet, backing off
//! on handler failures, and translating handler outcomes into FIN/REQ/TOUCH.
//!
//! # Design notes
//! A single controller task owns all mutable state: the connection map, RDY
//! accounting, and the backoff machine. Connection actors only parse frames
//! and forward events; message dispositions and public API calls funnel in
//! over channels, so every invariant is maintained from one place. Handlers
//! run on the controller task: a blocking handler stalls the whole Reader,
//! which is the documented trade-off of the synchronous mode - use
//! [`Disposition::Defer`] or [`Message::enable_async`] to process elsewhere.
use nsq_wire::{Command, MessageBody};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{
    CLOSE_GRACE, CONNECT_THROTTLE, Config, DEFAULT_MAX_RDY_COUNT, IdentifyResponse,
    RECONNECT_BASE, RECONNECT_MAX,
};
use crate::conn::{self, ConnCommand, ConnEvent, ConnHandle, ConnId};
use crate::discovery::{self, PollerConfig};
use crate::error::{Error, Result};
use crate::message::{Disposition, Message, ResponseAction, ResponseEvent};

mod backoff;
mod rdy;

use backoff::{BackoffAction, BackoffController};

/// The message-processing capability handed to a Reader.
///
/// Closures `FnMut(Message) -> Disposition` implement it directly.
pub trait Handler: Send + 'static {
    fn handle(&mut self, message: Message) -> Disposition;
}

impl<F> Handler for F
where
    F: FnMut(Message) -> Disposition + Send + 'static,
{
    fn handle(&mut self, message: Message) -> Disposition {
        self(message)
    }
}

type PreprocessFn =
    Box<dyn FnMut(&mut Message) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;
type ValidateFn = Box<dyn FnMut(&Message) -> bool + Send>;
type MaxAttemptsFn = Box<dyn FnMut(&Message) + Send>;

enum ApiEvent {
    SetMaxInFlight(u32),
    IsStarved(oneshot::Sender<bool>),
    Close(oneshot::Sender<()>),
    BackoffTimer { generation: u64 },
    Reconnect { addr: String },
    CloseTimeout,
}

/// Handle to a running consumer. Dropping it leaves the consumer running
/// detached; call [`Reader::close`] for an orderly shutdown.
#[derive(Debug)]
pub struct Reader {
    api_tx: mpsc::UnboundedSender<ApiEvent>,
}

impl Reader {
    pub fn builder(topic: impl Into<String>, channel: impl Into<String>) -> ReaderBuilder {
        ReaderBuilder {
            topic: topic.into(),
            channel: channel.into(),
            config: Config::default(),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            handler: None,
            preprocess: None,
            validate: None,
            max_attempts: None,
        }
    }

    /// Adjust the global RDY budget. `0` pauses delivery on every
    /// connection without tearing any of them down.
    pub fn set_max_in_flight(&self, max_in_flight: u32) {
        let _ = self.api_tx.send(ApiEvent::SetMaxInFlight(max_in_flight));
    }

    /// True when some connection's in-flight load is at 85% or more of its
    /// advertised RDY - a signal that batching handlers should flush.
    pub async fn is_starved(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.api_tx.send(ApiEvent::IsStarved(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Graceful shutdown: CLS on every connection, a bounded wait for
    /// in-flight messages to drain, then teardown. Returns once every
    /// connection is closed.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.api_tx.send(ApiEvent::Close(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

pub struct ReaderBuilder {
    topic: String,
    channel: String,
    config: Config,
    nsqd_tcp_addresses: Vec<String>,
    lookupd_http_addresses: Vec<String>,
    handler: Option<Box<dyn Handler>>,
    preprocess: Option<PreprocessFn>,
    validate: Option<ValidateFn>,
    max_attempts: Option<MaxAttemptsFn>,
}

impl ReaderBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Static broker set; each address reconnects on its own schedule.
    pub fn nsqd_tcp_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nsqd_tcp_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Discovery via nsqlookupd polling.
    pub fn lookupd_http_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookupd_http_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Runs before the handler; an error requeues the message with backoff.
    pub fn preprocess<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Message) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + 'static,
    {
        self.preprocess = Some(Box::new(f));
        self
    }

    /// Runs before the handler; returning false finishes the message
    /// without invoking it.
    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        self.validate = Some(Box::new(f));
        self
    }

    /// Invoked once per message whose attempt count exceeds `max_tries`.
    pub fn on_max_attempts<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.max_attempts = Some(Box::new(f));
        self
    }

    /// Validate the configuration and start the consumer. Must be called
    /// within a tokio runtime.
    pub fn build(self) -> Result<Reader> {
        if !nsq_wire::valid_topic_name(&self.topic) {
            return Err(Error::Config(format!("invalid topic name {:?}", self.topic)));
        }
        if !nsq_wire::valid_channel_name(&self.channel) {
            return Err(Error::Config(format!(
                "invalid channel name {:?}",
                self.channel
            )));
        }
        self.config.validate()?;
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("a message handler is required".into()))?;
        if self.nsqd_tcp_addresses.is_empty() && self.lookupd_http_addresses.is_empty() {
            return Err(Error::Config(
                "at least one nsqd or lookupd address is required".into(),
            ));
        }

        let config = Arc::new(self.config);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let (discovered_tx, discovered_rx) = mpsc::unbounded_channel();

        let discovery = if self.lookupd_http_addresses.is_empty() {
            None
        } else {
            Some(discovery::spawn_poller(
                PollerConfig {
                    addresses: self.lookupd_http_addresses,
                    topic: self.topic.clone(),
                    poll_interval: config.lookupd_poll_interval,
                    poll_jitter: config.lookupd_poll_jitter,
                    request_timeout: config.lookupd_request_timeout,
                },
                discovered_tx,
            ))
        };

        info!(topic = %self.topic, channel = %self.channel, "starting reader");
        let controller = Controller {
            topic: self.topic,
            channel: self.channel,
            max_in_flight: config.max_in_flight,
            backoff: BackoffController::new(
                config.backoff_enabled,
                config.backoff_base,
                config.max_backoff_duration,
            ),
            config,
            handler,
            preprocess: self.preprocess,
            validate: self.validate,
            max_attempts: self.max_attempts,
            conn_tx,
            response_tx,
            api_tx: api_tx.clone(),
            conns: HashMap::new(),
            total_rdy: 0,
            backoff_generation: 0,
            need_rdy_redistributed: false,
            rdy_rotation: 0,
            connection_attempts: HashMap::new(),
            reconnect_attempts: HashMap::new(),
            direct_addresses: self.nsqd_tcp_addresses,
            discovery,
            closing: false,
            close_acks: Vec::new(),
        };
        tokio::spawn(controller.run(conn_rx, response_rx, api_rx, discovered_rx));

        Ok(Reader { api_tx })
    }
}

struct ConnState {
    handle: ConnHandle,
    ready: bool,
    closing: bool,
    rdy_count: u32,
    last_sent_rdy: u32,
    in_flight: u32,
    max_rdy_count: u32,
    last_msg_at: Instant,
    last_rdy_at: Instant,
}

impl ConnState {
    fn new(handle: ConnHandle) -> Self {
        let now = Instant::now();
        Self {
            handle,
            ready: false,
            closing: false,
            rdy_count: 0,
            last_sent_rdy: 0,
            in_flight: 0,
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            last_msg_at: now,
            last_rdy_at: now,
        }
    }
}

struct Controller {
    topic: String,
    channel: String,
    config: Arc<Config>,
    handler: Box<dyn Handler>,
    preprocess: Option<PreprocessFn>,
    validate: Option<ValidateFn>,
    max_attempts: Option<MaxAttemptsFn>,
    conn_tx: mpsc::UnboundedSender<(ConnId, ConnEvent)>,
    response_tx: mpsc::UnboundedSender<ResponseEvent>,
    api_tx: mpsc::UnboundedSender<ApiEvent>,
    conns: HashMap<ConnId, ConnState>,
    /// Sum of `last_sent_rdy` across live connections.
    total_rdy: u32,
    max_in_flight: u32,
    backoff: BackoffController,
    backoff_generation: u64,
    need_rdy_redistributed: bool,
    rdy_rotation: u64,
    connection_attempts: HashMap<String, Instant>,
    reconnect_attempts: HashMap<String, u32>,
    direct_addresses: Vec<String>,
    discovery: Option<tokio::task::JoinHandle<()>>,
    closing: bool,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl Controller {
    async fn run(
        mut self,
        mut conn_rx: mpsc::UnboundedReceiver<(ConnId, ConnEvent)>,
        mut response_rx: mpsc::UnboundedReceiver<ResponseEvent>,
        mut api_rx: mpsc::UnboundedReceiver<ApiEvent>,
        mut discovered_rx: mpsc::UnboundedReceiver<Vec<String>>,
    ) {
        let direct = std::mem::take(&mut self.direct_addresses);
        for addr in &direct {
            self.connect_to_nsqd(addr);
        }
        self.direct_addresses = direct;

        let mut redistribute = tokio::time::interval(self.config.rdy_redistribute_interval);
        redistribute.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some((id, event)) = conn_rx.recv() => self.on_conn_event(id, event),
                Some(event) = response_rx.recv() => self.on_response(event),
                Some(addresses) = discovered_rx.recv() => self.on_discovered(addresses),
                Some(event) = api_rx.recv() => self.on_api_event(event),
                _ = redistribute.tick() => self.redistribute_rdy(),
            }
            if self.closing && self.conns.is_empty() {
                for ack in self.close_acks.drain(..) {
                    let _ = ack.send(());
                }
                info!(topic = %self.topic, channel = %self.channel, "reader closed");
                return;
            }
        }
    }

    fn on_conn_event(&mut self, id: ConnId, event: ConnEvent) {
        match event {
            ConnEvent::Ready { identify } => self.on_conn_ready(id, identify),
            ConnEvent::Message(body) => self.on_message(id, body),
            ConnEvent::Heartbeat => debug!(conn = %id, "heartbeat"),
            ConnEvent::Response(data) => {
                debug!(conn = %id, response = %String::from_utf8_lossy(&data), "response");
            }
            // Transient broker errors are already logged by the actor.
            ConnEvent::BrokerError(_) => {}
            ConnEvent::Closed { error } => self.on_conn_closed(id, error),
        }
    }

    fn on_conn_ready(&mut self, id: ConnId, identify: IdentifyResponse) {
        self.reconnect_attempts.remove(id.as_ref());
        let max_rdy = identify.max_rdy_count();
        if max_rdy < self.max_in_flight {
            warn!(
                conn = %id,
                max_rdy_count = max_rdy,
                max_in_flight = self.max_in_flight,
                "broker max RDY count below max_in_flight, truncation possible"
            );
        }
        let closing = self.closing;
        {
            let Some(state) = self.conns.get_mut(&id) else {
                return;
            };
            state.ready = true;
            state.max_rdy_count = max_rdy;
            if closing {
                state.closing = true;
                state.handle.send(ConnCommand::Cls);
                return;
            }
        }
        info!(conn = %id, version = %identify.version, topic = %self.topic, "subscribed");

        // The fleet grew: shrink everyone to the new per-connection ceiling
        // before the newcomer gets credit.
        let per_conn = rdy::per_conn_max_in_flight(self.max_in_flight, self.ready_conn_count());
        let over: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, s)| s.ready && !s.closing && s.last_sent_rdy > per_conn)
            .map(|(cid, _)| cid.clone())
            .collect();
        for cid in over {
            self.send_rdy(&cid, per_conn);
        }

        // A tentative RDY 1; the first message ramps to the full allocation.
        // During backoff some other connection is already probing, unless
        // this is the only one.
        if !self.backoff.in_backoff() || self.ready_conn_count() == 1 {
            self.send_rdy(&id, 1);
        }
    }

    fn on_message(&mut self, id: ConnId, body: MessageBody) {
        {
            let Some(state) = self.conns.get_mut(&id) else {
                return;
            };
            state.last_msg_at = Instant::now();
            state.in_flight += 1;
            state.rdy_count = state.rdy_count.saturating_sub(1);
        }
        self.maybe_update_rdy(&id);

        let mut message = Message::new(body, id, self.response_tx.clone());

        let max_tries = self.config.max_tries;
        if max_tries > 0 && message.attempts() > max_tries {
            warn!(
                id = %message.id(),
                attempts = message.attempts(),
                max_tries,
                "giving up on message"
            );
            if let Some(hook) = self.max_attempts.as_mut()
                && catch_unwind(AssertUnwindSafe(|| hook(&message))).is_err()
            {
                error!(id = %message.id(), "max-attempts hook panicked");
            }
            message.finish();
            return;
        }

        if let Some(pre) = self.preprocess.as_mut() {
            match catch_unwind(AssertUnwindSafe(|| pre(&mut message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(id = %message.id(), error = %e, "preprocess rejected message");
                    message.requeue(None, true);
                    return;
                }
                Err(_) => {
                    error!(id = %message.id(), "preprocess panicked");
                    message.requeue(None, true);
                    return;
                }
            }
        }

        if let Some(validate) = self.validate.as_mut() {
            match catch_unwind(AssertUnwindSafe(|| validate(&message))) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id = %message.id(), "message failed validation");
                    message.finish();
                    return;
                }
                Err(_) => {
                    error!(id = %message.id(), "validate panicked");
                    message.requeue(None, true);
                    return;
                }
            }
        }

        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(message.clone()))) {
            Err(_) => {
                error!(id = %message.id(), "handler panicked");
                if !message.has_responded() {
                    message.requeue(None, true);
                }
            }
            Ok(disposition) => {
                if message.has_responded() || message.is_async() {
                    return;
                }
                match disposition {
                    Disposition::Defer => {}
                    Disposition::Finish => message.finish(),
                    Disposition::Requeue { delay, backoff } => message.requeue(delay, backoff),
                }
            }
        }
    }

    fn on_response(&mut self, event: ResponseEvent) {
        let ResponseEvent {
            conn,
            id,
            attempts,
            action,
        } = event;
        if !self.conns.contains_key(&conn) {
            // The broker re-delivers after its own timeout; responding on a
            // dead connection would be a protocol error.
            debug!(conn = %conn, id = %id, "late response for a closed connection, dropping");
            return;
        }
        match action {
            ResponseAction::Finish => {
                if let Some(state) = self.conns.get_mut(&conn) {
                    state.in_flight = state.in_flight.saturating_sub(1);
                }
                let action = self.backoff.success();
                self.apply_backoff(action);
                // A freed slot may grow this connection's RDY; the refresh
                // must hit the wire before the FIN.
                self.maybe_update_rdy(&conn);
                if let Some(state) = self.conns.get(&conn) {
                    state.handle.send(ConnCommand::Send(Command::Fin(id)));
                }
                self.check_close_drain();
            }
            ResponseAction::Requeue { delay, backoff } => {
                if let Some(state) = self.conns.get_mut(&conn) {
                    state.in_flight = state.in_flight.saturating_sub(1);
                }
                if backoff {
                    let action = self.backoff.failure();
                    self.apply_backoff(action);
                }
                let delay_ms = match delay {
                    Some(d) => d.as_millis() as u64,
                    None => self.config.requeue_delay.as_millis() as u64 * attempts as u64,
                };
                self.maybe_update_rdy(&conn);
                if let Some(state) = self.conns.get(&conn) {
                    state
                        .handle
                        .send(ConnCommand::Send(Command::Requeue { id, delay_ms }));
                }
                self.check_close_drain();
            }
            ResponseAction::Touch => {
                if let Some(state) = self.conns.get(&conn) {
                    state.handle.send(ConnCommand::Send(Command::Touch(id)));
                }
            }
        }
    }

    fn on_conn_closed(&mut self, id: ConnId, error: Option<Error>) {
        let Some(state) = self.conns.remove(&id) else {
            return;
        };
        self.total_rdy = self.total_rdy.saturating_sub(state.last_sent_rdy);
        match &error {
            Some(e) => warn!(conn = %id, error = %e, "connection closed"),
            None => info!(conn = %id, "connection closed"),
        }

        // This connection's credit has to move elsewhere if we were
        // saturated or mid-backoff.
        if state.last_sent_rdy > 0
            && (self.conns.len() as u32 >= self.max_in_flight || self.backoff.in_backoff())
        {
            self.need_rdy_redistributed = true;
        }

        if self.closing {
            return;
        }

        if self.discovery.is_none() {
            // Direct mode reconnects on a bounded schedule of its own.
            let addr = id.to_string();
            let attempts = self.reconnect_attempts.entry(addr.clone()).or_insert(0);
            *attempts += 1;
            let delay = (RECONNECT_BASE * *attempts).min(RECONNECT_MAX);
            info!(conn = %id, ?delay, "reconnecting after delay");
            let api = self.api_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = api.send(ApiEvent::Reconnect { addr });
            });
        }
    }

    fn on_discovered(&mut self, addresses: Vec<String>) {
        if self.closing {
            return;
        }
        for addr in addresses {
            self.connect_to_nsqd(&addr);
        }
    }

    fn on_api_event(&mut self, event: ApiEvent) {
        match event {
            ApiEvent::SetMaxInFlight(max_in_flight) => {
                info!(max_in_flight, "max_in_flight changed");
                self.max_in_flight = max_in_flight;
                if max_in_flight == 0 {
                    let ids = self.ready_conn_ids();
                    for id in ids {
                        self.send_rdy(&id, 0);
                    }
                } else {
                    self.need_rdy_redistributed = true;
                    self.redistribute_rdy();
                }
            }
            ApiEvent::IsStarved(reply) => {
                let starved = self
                    .conns
                    .values()
                    .any(|s| rdy::is_starved(s.in_flight, s.last_sent_rdy));
                let _ = reply.send(starved);
            }
            ApiEvent::BackoffTimer { generation } => {
                if generation == self.backoff_generation && !self.closing {
                    let action = self.backoff.timer_expired();
                    self.apply_backoff(action);
                }
            }
            ApiEvent::Reconnect { addr } => {
                if !self.closing {
                    self.connect_to_nsqd(&addr);
                }
            }
            ApiEvent::Close(ack) => self.begin_close(ack),
            ApiEvent::CloseTimeout => {
                // Bounds close() even when a connection is wedged in its
                // handshake; late Closed events find no entry and are
                // ignored.
                if self.closing && !self.conns.is_empty() {
                    warn!(
                        conns = self.conns.len(),
                        "close grace expired, dropping remaining connections"
                    );
                    for state in self.conns.values() {
                        state.handle.send(ConnCommand::HardClose);
                    }
                    self.conns.clear();
                }
            }
        }
    }

    fn begin_close(&mut self, ack: oneshot::Sender<()>) {
        self.close_acks.push(ack);
        if self.closing {
            return;
        }
        self.closing = true;
        info!(topic = %self.topic, channel = %self.channel, "closing reader");
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
        // Cancels any pending backoff timer.
        self.backoff_generation += 1;
        for state in self.conns.values_mut() {
            state.closing = true;
            state.handle.send(ConnCommand::Cls);
        }
        let api = self.api_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            let _ = api.send(ApiEvent::CloseTimeout);
        });
        self.check_close_drain();
    }

    fn check_close_drain(&mut self) {
        if !self.closing {
            return;
        }
        let in_flight: u32 = self.conns.values().map(|s| s.in_flight).sum();
        if in_flight == 0 {
            for state in self.conns.values() {
                state.handle.send(ConnCommand::HardClose);
            }
        }
    }

    fn connect_to_nsqd(&mut self, addr: &str) {
        if self.closing || self.conns.contains_key(addr) {
            return;
        }
        // At most one attempt per endpoint per throttle window.
        let now = Instant::now();
        if let Some(last) = self.connection_attempts.get(addr)
            && now.duration_since(*last) < CONNECT_THROTTLE
        {
            return;
        }
        self.connection_attempts.insert(addr.to_string(), now);

        info!(addr, topic = %self.topic, "connecting to nsqd");
        let handle = conn::spawn(
            addr,
            Some((self.topic.clone(), self.channel.clone())),
            self.config.clone(),
            self.conn_tx.clone(),
        );
        self.conns.insert(handle.id.clone(), ConnState::new(handle));
    }

    /// Grow or refresh one connection's RDY after a message event.
    fn maybe_update_rdy(&mut self, conn: &ConnId) {
        if self.backoff.in_backoff() || self.max_in_flight == 0 || self.closing {
            return;
        }
        let target = rdy::per_conn_max_in_flight(self.max_in_flight, self.ready_conn_count());
        let Some(state) = self.conns.get(conn) else {
            return;
        };
        if !state.ready || state.closing {
            return;
        }
        if state.last_sent_rdy < target || rdy::needs_refresh(state.rdy_count, state.last_sent_rdy)
        {
            self.send_rdy(conn, target);
        }
    }

    fn send_rdy(&mut self, conn: &ConnId, value: u32) {
        let max_in_flight = self.max_in_flight;
        let total_rdy = self.total_rdy;
        let Some(state) = self.conns.get_mut(conn) else {
            return;
        };
        if !state.ready {
            return;
        }
        let value = value.min(state.max_rdy_count);
        let new_total = total_rdy.saturating_sub(state.last_sent_rdy) + value;
        // Never advertise more credit than the global budget.
        if value > 0 && new_total > max_in_flight {
            return;
        }
        self.total_rdy = new_total;
        state.rdy_count = value;
        state.last_sent_rdy = value;
        state.last_rdy_at = Instant::now();
        state.handle.send(ConnCommand::Send(Command::Rdy(value)));
        debug!(conn = %conn, rdy = value, total_rdy = self.total_rdy, "rdy");
    }

    fn apply_backoff(&mut self, action: BackoffAction) {
        match action {
            BackoffAction::None => {}
            BackoffAction::EnterBackoff(delay) => {
                info!(
                    level = self.backoff.level(),
                    ?delay,
                    conns = self.conns.len(),
                    "backing off"
                );
                let ids = self.ready_conn_ids();
                for id in ids {
                    self.send_rdy(&id, 0);
                }
                self.start_backoff_timer(delay);
            }
            BackoffAction::Probe => {
                if self.max_in_flight == 0 {
                    return;
                }
                let candidates = self.ready_conn_ids();
                if candidates.is_empty() {
                    return;
                }
                let pick = candidates[rand::random_range(0..candidates.len())].clone();
                info!(conn = %pick, "testing backoff state with RDY 1");
                self.send_rdy(&pick, 1);
            }
            BackoffAction::Resume => {
                let per_conn =
                    rdy::per_conn_max_in_flight(self.max_in_flight, self.ready_conn_count());
                info!(
                    conns = self.conns.len(),
                    rdy = per_conn,
                    "backoff complete, resuming normal operation"
                );
                let ids = self.ready_conn_ids();
                for id in ids {
                    self.send_rdy(&id, per_conn);
                }
            }
        }
    }

    fn start_backoff_timer(&mut self, delay: Duration) {
        self.backoff_generation += 1;
        let generation = self.backoff_generation;
        let api = self.api_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = api.send(ApiEvent::BackoffTimer { generation });
        });
    }

    /// Periodic RDY rebalancing; covers the `max_in_flight < N` rotation,
    /// backoff probe placement, and remainder fairness.
    fn redistribute_rdy(&mut self) {
        if self.closing || self.conns.is_empty() || self.max_in_flight == 0 {
            return;
        }
        if self.backoff.blocks_rdy() {
            return;
        }
        let ready = self.ready_conn_ids();
        let count = ready.len() as u32;
        if count == 0 {
            return;
        }

        if count > self.max_in_flight {
            self.need_rdy_redistributed = true;
        }
        if self.backoff.in_backoff() && count > 1 {
            self.need_rdy_redistributed = true;
        }

        if !self.need_rdy_redistributed {
            if !self.backoff.in_backoff() {
                self.rotate_remainder(&ready);
            }
            return;
        }
        self.need_rdy_redistributed = false;

        // Idle connections give their credit back first; credit granted
        // within the window is left alone.
        let idle_timeout = self.config.low_rdy_idle_timeout;
        for id in &ready {
            let Some(state) = self.conns.get(id) else {
                continue;
            };
            let idle_for = state.last_msg_at.elapsed();
            if state.rdy_count > 0
                && idle_for > idle_timeout
                && state.last_rdy_at.elapsed() > idle_timeout
            {
                info!(conn = %id, ?idle_for, "idle connection, giving up RDY");
                self.send_rdy(id, 0);
            }
        }

        let in_flight_or_rdy = ready
            .iter()
            .filter(|id| {
                self.conns
                    .get(*id)
                    .is_some_and(|s| s.in_flight > 0 || s.rdy_count > 0)
            })
            .count() as u32;
        let mut available = if self.backoff.in_backoff() {
            1u32.saturating_sub(in_flight_or_rdy)
        } else {
            self.max_in_flight.saturating_sub(in_flight_or_rdy)
        };

        // If everything is pinned by in-flight messages, unpin one at random
        // so later rounds can move credit around.
        let busy: Vec<&ConnId> = ready
            .iter()
            .filter(|id| self.conns.get(*id).is_some_and(|s| s.in_flight > 0))
            .collect();
        if !busy.is_empty() && available == 0 {
            let pick = busy[rand::random_range(0..busy.len())].clone();
            info!(conn = %pick, "too many messages in flight, giving up RDY");
            self.send_rdy(&pick, 0);
        }

        let mut possible: Vec<ConnId> = ready
            .iter()
            .filter(|id| {
                self.conns
                    .get(*id)
                    .is_some_and(|s| s.in_flight == 0 && s.rdy_count == 0)
            })
            .cloned()
            .collect();
        while !possible.is_empty() && available > 0 {
            available -= 1;
            let id = possible.swap_remove(rand::random_range(0..possible.len()));
            info!(conn = %id, "redistributing RDY");
            self.send_rdy(&id, 1);
        }
    }

    /// When the budget does not divide evenly, rotate the +1 remainder
    /// across the fleet so the extra credit is fair over time.
    fn rotate_remainder(&mut self, ready: &[ConnId]) {
        let count = ready.len() as u32;
        if count == 0 || self.max_in_flight < count {
            return;
        }
        let base = self.max_in_flight / count;
        let remainder = (self.max_in_flight % count) as usize;
        if remainder == 0 {
            return;
        }
        let mut ids: Vec<ConnId> = ready.to_vec();
        ids.sort();
        self.rdy_rotation = self.rdy_rotation.wrapping_add(1);
        let offset = (self.rdy_rotation as usize) % ids.len();
        let bonus: HashSet<ConnId> = (0..remainder)
            .map(|i| ids[(offset + i) % ids.len()].clone())
            .collect();
        // Shrink the demoted connections first so the budget admits the
        // promotions.
        for id in &ids {
            let demote = !bonus.contains(id)
                && self
                    .conns
                    .get(id)
                    .is_some_and(|s| s.last_sent_rdy > base);
            if demote {
                self.send_rdy(id, base);
            }
        }
        for id in &bonus {
            let promote = self
                .conns
                .get(id)
                .is_some_and(|s| s.last_sent_rdy != base + 1);
            if promote {
                self.send_rdy(id, base + 1);
            }
        }
    }

    fn ready_conn_count(&self) -> usize {
        self.conns
            .values()
            .filter(|s| s.ready && !s.closing)
            .count()
    }

    fn ready_conn_ids(&self) -> Vec<ConnId> {
        self.conns
            .iter()
            .filter(|(_, s)| s.ready && !s.closing)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
