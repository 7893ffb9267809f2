//! Listen stream connection management.
//!
//! [StreamConnection] is the connection state machine. It never touches a
//! socket: every socket event is fed into one of its `on_*` methods, which
//! update the state and return [Directive]s telling the driver what I/O to
//! perform. The driver task spawned by [ConnectionHandle::spawn] owns the
//! websocket and the reconnect timer and runs all handlers on one task, so
//! the state machine is only ever mutated from a single flow.

use crate::{
    constants::{ABNORMAL_CLOSE_CODE, NORMAL_CLOSE_CODES, RECONNECT_DELAY},
    control::{self, ControlMessage},
    event::{Event, EventBus},
    frame::AudioChunk,
    scheduler::PlaybackScheduler,
};
use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use std::{fmt::Display, future::Future, pin::Pin, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{sleep, Sleep},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when a close frame carries no status
const NO_STATUS_CODE: u16 = 1005;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Listening,
    Reconnecting,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Listening => "listening",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        }
    }

    /// Whether a socket is open or being opened in this state
    fn has_socket(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Listening)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an abnormal close is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// When false an abnormal close ends the connection like a clean one
    pub enabled: bool,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: RECONNECT_DELAY,
        }
    }
}

/// I/O requested by the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Open a socket to the endpoint
    Open(String),

    /// Close the current socket with the given code
    Close(u16),

    /// Arm the reconnect timer for the given generation
    ScheduleReconnect { delay: Duration, generation: u64 },

    /// Disarm any pending reconnect timer
    CancelReconnect,

    /// Far end reported that the call is over
    CallEnded,

    /// A frame reached the scheduler, report the playback backlog
    ReportPlayback,
}

/// Notifications published on the [EventBus] for the presentation layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        generation: u64,
        state: ConnectionState,
        /// Why the connection failed, set with [ConnectionState::Errored]
        reason: Option<String>,
    },
    CallEnded {
        generation: u64,
    },
    /// Best-effort playback backlog after handling an audio frame
    Playback {
        queue_depth: usize,
        buffered_secs: f64,
    },
}

pub struct StreamConnection {
    state: ConnectionState,
    endpoint: Option<String>,

    /// Bumped on every connect, identifies the socket session events belong to
    generation: u64,

    /// Generation of the armed reconnect timer, if any
    reconnect_pending: Option<u64>,

    /// What sent the connection to Errored
    last_error: Option<String>,

    policy: ReconnectPolicy,
    scheduler: PlaybackScheduler,
}

impl StreamConnection {
    pub fn new(scheduler: PlaybackScheduler, policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint: None,
            generation: 0,
            reconnect_pending: None,
            last_error: None,
            policy,
            scheduler,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending.is_some()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail(&mut self, reason: String) {
        self.last_error = Some(reason);
        self.set_state(ConnectionState::Errored);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Starts listening to `endpoint`, replacing whatever was connected before.
    pub fn connect(&mut self, endpoint: &str) -> Vec<Directive> {
        let mut directives = vec![Directive::CancelReconnect];
        self.reconnect_pending = None;

        if self.state.has_socket() {
            directives.push(Directive::Close(NORMAL_CLOSURE));
        }

        // Audio from a previous endpoint must not bleed into the new one
        self.scheduler.stop();

        self.generation += 1;
        self.last_error = None;
        self.endpoint = Some(endpoint.to_string());
        self.set_state(ConnectionState::Connecting);

        info!("Connecting to listen stream {endpoint}");
        directives.push(Directive::Open(endpoint.to_string()));
        directives
    }

    pub fn on_open(&mut self) -> Vec<Directive> {
        if self.state != ConnectionState::Connecting {
            warn!("Socket opened while {}, closing it", self.state);
            return vec![Directive::Close(NORMAL_CLOSURE)];
        }

        self.reconnect_pending = None;

        if let Err(e) = self.scheduler.start_clock() {
            error!("{e:?}");
            self.scheduler.stop();
            self.fail(format!("{e:#}"));
            return vec![Directive::Close(NORMAL_CLOSURE)];
        }

        self.set_state(ConnectionState::Listening);
        info!("Listening to call audio");
        vec![Directive::CancelReconnect]
    }

    /// Validate, decode, enqueue and drain one binary frame.
    pub fn on_binary(&mut self, frame: &[u8]) -> Vec<Directive> {
        if self.state != ConnectionState::Listening {
            debug!("Ignoring {} byte frame while {}", frame.len(), self.state);
            return vec![];
        }

        let Some(chunk) = AudioChunk::from_frame(frame) else {
            return vec![];
        };

        self.scheduler.enqueue(chunk);
        self.scheduler.drain();
        vec![Directive::ReportPlayback]
    }

    pub fn on_text(&mut self, text: &str) -> Vec<Directive> {
        match control::parse(text) {
            Ok(ControlMessage::CallEnded) => {
                info!("Far end reported the call has ended");
                let mut directives = self.stop();
                directives.push(Directive::CallEnded);
                directives
            }
            Ok(ControlMessage::Other(kind)) => {
                debug!("Ignoring control message of type {kind:?}");
                vec![]
            }
            Err(e) => {
                warn!("Ignoring malformed control message: {e:?}");
                vec![]
            }
        }
    }

    pub fn on_close(&mut self, code: u16) -> Vec<Directive> {
        if !self.state.has_socket() {
            debug!("Close ({code}) after connection was {}, ignoring", self.state);
            return vec![];
        }

        if NORMAL_CLOSE_CODES.contains(&code) {
            info!("Listen stream closed ({code})");
            self.scheduler.stop();
            self.set_state(ConnectionState::Closed);
            return vec![Directive::CancelReconnect];
        }

        // A failed handshake on the retry is not retried again
        let can_retry = self.policy.enabled
            && self.endpoint.is_some()
            && self.state == ConnectionState::Listening;

        if !can_retry {
            warn!("Listen stream closed abnormally ({code}), not reconnecting");
            self.scheduler.stop();
            if self.policy.enabled {
                self.fail(format!("Listen stream closed abnormally ({code})"));
            } else {
                self.set_state(ConnectionState::Closed);
            }
            return vec![Directive::CancelReconnect];
        }

        warn!(
            "Listen stream closed abnormally ({code}), reconnecting in {:?}",
            self.policy.delay
        );
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_pending = Some(self.generation);

        vec![Directive::ScheduleReconnect {
            delay: self.policy.delay,
            generation: self.generation,
        }]
    }

    pub fn on_error(&mut self, message: &str) -> Vec<Directive> {
        error!("Listen stream transport error: {message}");

        let mut directives = vec![Directive::CancelReconnect];
        if self.state.has_socket() {
            directives.push(Directive::Close(NORMAL_CLOSURE));
        }

        self.reconnect_pending = None;
        self.scheduler.stop();
        self.fail(message.to_string());
        directives
    }

    /// Reconnect timer for `generation` fired.
    pub fn on_reconnect_timer(&mut self, generation: u64) -> Vec<Directive> {
        let armed = self.reconnect_pending == Some(generation)
            && generation == self.generation
            && self.state == ConnectionState::Reconnecting;

        if !armed {
            debug!("Stale reconnect timer for generation {generation}, ignoring");
            return vec![];
        }

        self.reconnect_pending = None;

        let Some(endpoint) = self.endpoint.clone() else {
            self.set_state(ConnectionState::Closed);
            return vec![];
        };

        info!("Reconnecting to listen stream {endpoint}");
        self.set_state(ConnectionState::Connecting);
        vec![Directive::Open(endpoint)]
    }

    /// Explicit stop: cancel any reconnect, close normally and release audio.
    pub fn stop(&mut self) -> Vec<Directive> {
        let mut directives = vec![Directive::CancelReconnect];
        self.reconnect_pending = None;

        if self.state.has_socket() {
            directives.push(Directive::Close(NORMAL_CLOSURE));
        }

        self.scheduler.stop();
        self.endpoint = None;

        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Closed);
        }

        directives
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsMessage = Option<Result<Message, tokio_tungstenite::tungstenite::Error>>;
type PendingOpen = Pin<Box<dyn Future<Output = (u64, Result<WsStream>)> + Send>>;

enum Command {
    Connect {
        endpoint: String,
        reply: oneshot::Sender<u64>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running connection driver.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    /// Spawns the driver task. It runs until every handle is dropped.
    pub fn spawn(bus: &EventBus, connection: StreamConnection) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            bus: bus.clone(),
            connection,
            socket: None,
            opening: None,
            reconnect: None,
            published: ConnectionState::Disconnected,
        };

        tokio::spawn(driver.run(rx));

        Self { tx }
    }

    /// Connects to `endpoint` and returns the generation that events for this
    /// connection will carry.
    pub async fn connect(&self, endpoint: &str) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect {
                endpoint: endpoint.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("Connection driver has shut down"))?;

        rx.await.context("Connection driver dropped connect request")
    }

    /// Stops the connection and waits until teardown has been applied.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stop { reply })
            .map_err(|_| anyhow!("Connection driver has shut down"))?;

        rx.await.context("Connection driver dropped stop request")
    }
}

struct Driver {
    bus: EventBus,
    connection: StreamConnection,
    socket: Option<WsStream>,
    opening: Option<PendingOpen>,
    reconnect: Option<(u64, Pin<Box<Sleep>>)>,
    published: ConnectionState,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                (generation, result) = next_open(&mut self.opening) => {
                    self.opening = None;
                    self.handle_open(generation, result);
                }
                message = next_message(&mut self.socket) => {
                    self.handle_message(message);
                }
                generation = next_reconnect(&mut self.reconnect) => {
                    self.reconnect = None;
                    let directives = self.connection.on_reconnect_timer(generation);
                    self.apply(directives);
                }
            }

            self.publish_state();
        }

        let directives = self.connection.stop();
        self.apply(directives);
        self.publish_state();
        debug!("Connection driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => {
                let directives = self.connection.connect(&endpoint);
                self.apply(directives);
                // Publish Connecting under the new generation before replying
                self.publish_state();
                let _ = reply.send(self.connection.generation());
            }
            Command::Stop { reply } => {
                let directives = self.connection.stop();
                self.apply(directives);
                self.publish_state();
                let _ = reply.send(());
            }
        }
    }

    fn handle_open(&mut self, generation: u64, result: Result<WsStream>) {
        if generation != self.connection.generation() {
            debug!("Discarding socket opened for stale generation {generation}");
            return;
        }

        let directives = match result {
            Ok(socket) => {
                self.socket = Some(socket);
                self.connection.on_open()
            }
            Err(e) => self.connection.on_error(&format!("{e:#}")),
        };
        self.apply(directives);
    }

    fn handle_message(&mut self, message: WsMessage) {
        let directives = match message {
            Some(Ok(Message::Binary(data))) => self.connection.on_binary(&data),
            Some(Ok(Message::Text(text))) => self.connection.on_text(&text),
            Some(Ok(Message::Close(frame))) => {
                if let Some(socket) = self.socket.take() {
                    retire(socket);
                }
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS_CODE);
                self.connection.on_close(code)
            }
            Some(Ok(_)) => vec![],
            Some(Err(e)) => {
                debug!("Listen stream read error: {e}");
                self.socket = None;
                self.connection.on_close(ABNORMAL_CLOSE_CODE)
            }
            None => {
                self.socket = None;
                self.connection.on_close(ABNORMAL_CLOSE_CODE)
            }
        };
        self.apply(directives);
    }

    fn apply(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Open(endpoint) => {
                    let generation = self.connection.generation();
                    self.opening = Some(Box::pin(async move {
                        let result = connect_async(endpoint.as_str())
                            .await
                            .map(|(socket, _response)| socket)
                            .with_context(|| format!("Failed to connect to {endpoint}"));
                        (generation, result)
                    }));
                }
                Directive::Close(code) => {
                    self.opening = None;
                    if let Some(socket) = self.socket.take() {
                        close(socket, code);
                    }
                }
                Directive::ScheduleReconnect { delay, generation } => {
                    self.reconnect = Some((generation, Box::pin(sleep(delay))));
                }
                Directive::CancelReconnect => {
                    self.reconnect = None;
                }
                Directive::CallEnded => {
                    self.bus.send(Event::Connection(ConnectionEvent::CallEnded {
                        generation: self.connection.generation(),
                    }));
                }
                Directive::ReportPlayback => {
                    let scheduler = self.connection.scheduler();
                    self.bus.send(Event::Connection(ConnectionEvent::Playback {
                        queue_depth: scheduler.queue_depth(),
                        buffered_secs: scheduler.buffered_secs(),
                    }));
                }
            }
        }
    }

    fn publish_state(&mut self) {
        let state = self.connection.state();
        if state != self.published {
            self.published = state;
            let reason = match state {
                ConnectionState::Errored => self.connection.last_error().map(str::to_string),
                _ => None,
            };
            self.bus.send(Event::Connection(ConnectionEvent::StateChanged {
                generation: self.connection.generation(),
                state,
                reason,
            }));
        }
    }
}

/// Sends a close frame and finishes the closing handshake in the background.
fn close(mut socket: WsStream, code: u16) {
    tokio::spawn(async move {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = socket.close(Some(frame)).await {
            debug!("Error while closing listen stream: {e}");
        }
        while let Some(Ok(_)) = socket.next().await {}
    });
}

/// Lets a socket that received a close frame answer it and wind down.
fn retire(mut socket: WsStream) {
    tokio::spawn(async move { while let Some(Ok(_)) = socket.next().await {} });
}

async fn next_open(opening: &mut Option<PendingOpen>) -> (u64, Result<WsStream>) {
    match opening {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_message(socket: &mut Option<WsStream>) -> WsMessage {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn next_reconnect(reconnect: &mut Option<(u64, Pin<Box<Sleep>>)>) -> u64 {
    match reconnect {
        Some((generation, timer)) => {
            timer.as_mut().await;
            *generation
        }
        None => std::future::pending().await,
    }
}
