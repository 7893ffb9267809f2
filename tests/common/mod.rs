//! Test infrastructure for call-listen integration tests.
//!
//! Provides a scripted local listen-stream server, a harness that wires the
//! connection, scheduler and session together on one event bus, and helpers
//! for collecting events.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};

pub use call_listen::config::Config;
pub use call_listen::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionState, ReconnectPolicy, StreamConnection,
};
pub use call_listen::event::{Event, EventBus, Subscriber};
pub use call_listen::origination::{CallOriginator, CallResponse, HttpOriginator};
pub use call_listen::output::{self, OutputKind};
pub use call_listen::scheduler::PlaybackScheduler;
pub use call_listen::session::{self, CallSession, SessionAction, SessionState};

/// Reconnect delay used by the harness so tests stay fast
pub const TEST_RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Installs the rustls crypto provider the binary uses. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Encodes a constant PCM16 LE frame of `samples` samples.
pub fn pcm_frame(value: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat(value.to_le_bytes())
        .take(samples)
        .flatten()
        .collect()
}

/// One thing the scripted server does on a connection.
#[derive(Clone, Debug)]
pub enum Step {
    Binary(Vec<u8>),
    Text(String),
    /// Send a close frame with this code
    Close(u16),
    /// Drop the TCP connection without a closing handshake
    Drop,
    Pause(Duration),
    /// Hang up before the websocket handshake. Only meaningful as the first step.
    Refuse,
}

/// Local websocket server that plays a script to each client. Connection `n`
/// gets `scripts[n]`, or the last script once they run out. When a script
/// finishes without closing, the server waits for the client to go away.
pub struct ListenServer {
    pub url: String,
    connections: Arc<AtomicUsize>,
}

impl ListenServer {
    pub async fn start(scripts: Vec<Vec<Step>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/listen", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let script = scripts
                    .get(index)
                    .or_else(|| scripts.last())
                    .cloned()
                    .unwrap_or_default();

                tokio::spawn(async move {
                    if matches!(script.first(), Some(Step::Refuse)) {
                        return;
                    }

                    let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };

                    for step in script {
                        let sent = match step {
                            Step::Binary(data) => socket.send(Message::Binary(data)).await,
                            Step::Text(text) => socket.send(Message::Text(text)).await,
                            Step::Close(code) => {
                                let frame = CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: "".into(),
                                };
                                let _ = socket.close(Some(frame)).await;
                                while let Some(Ok(_)) = socket.next().await {}
                                return;
                            }
                            Step::Drop | Step::Refuse => return,
                            Step::Pause(duration) => {
                                tokio::time::sleep(duration).await;
                                Ok(())
                            }
                        };
                        if sent.is_err() {
                            return;
                        }
                    }

                    while let Some(Ok(_)) = socket.next().await {}
                });
            }
        });

        Self { url, connections }
    }

    /// Number of websocket connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Originator that always hands out the same listen URL.
pub struct StaticOriginator {
    pub listen_url: String,
}

#[async_trait]
impl CallOriginator for StaticOriginator {
    async fn originate(&self, _number: &str) -> anyhow::Result<CallResponse> {
        Ok(CallResponse {
            listen_url: Some(self.listen_url.clone()),
            call_id: Some("test-call".to_string()),
        })
    }
}

/// Test harness with a running connection driver and session task.
pub struct TestHarness {
    pub bus: EventBus,
    pub connection: ConnectionHandle,
}

impl TestHarness {
    /// Harness whose session places calls through `originator`.
    pub fn new(originator: Arc<dyn CallOriginator>) -> Self {
        Self::with_policy(
            originator,
            ReconnectPolicy {
                enabled: true,
                delay: TEST_RECONNECT_DELAY,
            },
        )
    }

    pub fn with_policy(originator: Arc<dyn CallOriginator>, policy: ReconnectPolicy) -> Self {
        install_crypto_provider();
        let bus = EventBus::new();
        let scheduler = PlaybackScheduler::new(16000, output::factory(OutputKind::Virtual));
        let connection = ConnectionHandle::spawn(&bus, StreamConnection::new(scheduler, policy));
        session::spawn(
            &bus,
            CallSession::new(&bus, originator, connection.clone()),
        );

        Self { bus, connection }
    }

    /// Harness listening to `url` through a [StaticOriginator].
    pub fn listening_to(url: &str) -> Self {
        Self::new(Arc::new(StaticOriginator {
            listen_url: url.to_string(),
        }))
    }

    pub fn subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    pub fn start(&self, number: &str) {
        self.bus.send(Event::Session(SessionAction::Start {
            number: number.to_string(),
        }));
    }

    pub fn stop(&self) {
        self.bus.send(Event::Session(SessionAction::Stop));
    }
}

pub fn is_session_state(event: &Event, state: &SessionState) -> bool {
    matches!(event, Event::Session(SessionAction::StateChanged(s)) if s == state)
}

pub fn is_connection_state(event: &Event, state: ConnectionState) -> bool {
    matches!(
        event,
        Event::Connection(ConnectionEvent::StateChanged { state: s, .. }) if *s == state
    )
}

pub fn session_states(events: &[Event]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Session(SessionAction::StateChanged(state)) => Some(state.clone()),
            _ => None,
        })
        .collect()
}

pub fn connection_states(events: &[Event]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Connection(ConnectionEvent::StateChanged { state, .. }) => Some(*state),
            _ => None,
        })
        .collect()
}

/// Collects all events from a subscriber within a timeout period.
pub async fn collect_events(subscriber: &mut Subscriber, timeout: Duration) -> Vec<Event> {
    collect_events_until(subscriber, timeout, |_| false).await
}

/// Collects events until a predicate is satisfied or timeout is reached.
pub async fn collect_events_until<F>(
    subscriber: &mut Subscriber,
    timeout: Duration,
    predicate: F,
) -> Vec<Event>
where
    F: Fn(&Event) -> bool,
{
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match subscriber.try_recv() {
            Ok(event) => {
                let should_stop = predicate(&event);
                events.push(event);
                if should_stop {
                    break;
                }
            }
            Err(TryRecvError::Empty) => {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(TryRecvError::Lagged(n)) => {
                eprintln!("Warning: subscriber lagged, missed {n} events");
            }
            Err(TryRecvError::Closed) => break,
        }
    }

    events
}

/// Temporary directory holding config files for a test.
pub struct ConfigFiles {
    pub dir: tempfile::TempDir,
}

impl ConfigFiles {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::TempDir::new()?,
        })
    }

    /// Path of the config file inside the directory, whether written or not.
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("Config.toml")
    }

    pub async fn write(&self, contents: &str) -> std::io::Result<std::path::PathBuf> {
        let path = self.path();
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }
}
