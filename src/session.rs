//! Call session control.
//!
//! A [CallSession] places the call through a [CallOriginator], hands the
//! returned listen URL to the stream connection and tracks the session state
//! the presentation layer shows. Commands and state changes travel over the
//! [EventBus] as [SessionAction]s.

use crate::{
    connection::{ConnectionEvent, ConnectionHandle, ConnectionState},
    event::{Event, EventBus},
    origination::CallOriginator,
};
use std::{fmt::Display, sync::Arc};
use tokio::task::JoinHandle;

pub const LISTEN_URL_MISSING: &str = "Listen URL not received";
pub const NUMBER_MISSING: &str = "Phone number is required";
pub const STREAM_FAILED: &str = "Listen stream connection failed";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Ended,
    Failed(String),
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
            SessionState::Failed(_) => "failed",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
            _ => f.write_str(self.as_str()),
        }
    }
}

#[derive(Clone, Debug)]
pub enum SessionAction {
    /// Place a call and start listening to it
    Start { number: String },

    /// Hang up the listener and go back to idle
    Stop,

    /// Notification that the session state changed
    StateChanged(SessionState),
}

pub struct CallSession {
    bus: EventBus,
    originator: Arc<dyn CallOriginator>,
    connection: ConnectionHandle,
    state: SessionState,
    call_id: Option<String>,
    endpoint: Option<String>,

    /// Connection generation this session is listening on
    generation: Option<u64>,
}

impl CallSession {
    pub fn new(
        bus: &EventBus,
        originator: Arc<dyn CallOriginator>,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            bus: bus.clone(),
            originator,
            connection,
            state: SessionState::Idle,
            call_id: None,
            endpoint: None,
            generation: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }

        info!("Session {state}");
        self.state = state.clone();
        self.bus
            .send(Event::Session(SessionAction::StateChanged(state)));
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.generation = None;
        self.set_state(SessionState::Failed(reason.into()));
    }

    /// Places a call to `number` and connects to its listen stream. Failures
    /// end up in [SessionState::Failed].
    pub async fn start(&mut self, number: &str) {
        let number = number.trim();
        if number.is_empty() {
            self.fail(NUMBER_MISSING);
            return;
        }

        // Starting over replaces the previous call's stream
        if self.generation.take().is_some() {
            if let Err(e) = self.connection.stop().await {
                warn!("Failed to stop previous listen stream: {e:?}");
            }
        }
        self.call_id = None;
        self.endpoint = None;

        self.set_state(SessionState::Starting);

        let response = match self.originator.originate(number).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Call origination failed: {e:?}");
                self.fail(e.to_string());
                return;
            }
        };

        let Some(listen_url) = response.listen_url.filter(|url| !url.trim().is_empty()) else {
            self.fail(LISTEN_URL_MISSING);
            return;
        };

        info!(
            "Call {} placed, listening on {listen_url}",
            response.call_id.as_deref().unwrap_or("(no id)")
        );
        self.call_id = response.call_id;
        self.endpoint = Some(listen_url.clone());

        match self.connection.connect(&listen_url).await {
            Ok(generation) => {
                self.generation = Some(generation);
                self.set_state(SessionState::Active);
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    /// Stops listening and resets to [SessionState::Idle]. Idle is always
    /// published, so a stop can be awaited even when nothing was running.
    pub async fn stop(&mut self) {
        self.generation = None;
        if let Err(e) = self.connection.stop().await {
            warn!("Failed to stop listen stream: {e:?}");
        }

        if self.state != SessionState::Idle {
            info!("Session {}", SessionState::Idle);
        }
        self.state = SessionState::Idle;
        self.bus
            .send(Event::Session(SessionAction::StateChanged(SessionState::Idle)));
    }

    /// Follows the connection of the current call. Events from earlier
    /// connections are ignored.
    pub fn handle_connection_event(&mut self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::CallEnded { generation } if self.generation == Some(*generation) => {
                self.generation = None;
                self.set_state(SessionState::Ended);
            }
            ConnectionEvent::StateChanged {
                generation,
                state,
                reason,
            }
                if self.generation == Some(*generation)
                    && self.state == SessionState::Active =>
            {
                match state {
                    ConnectionState::Closed => {
                        self.generation = None;
                        self.set_state(SessionState::Ended);
                    }
                    ConnectionState::Errored => match reason {
                        Some(reason) => self.fail(format!("{STREAM_FAILED}: {reason}")),
                        None => self.fail(STREAM_FAILED),
                    },
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Runs `session` on its own task, driven by events on the bus.
pub fn spawn(bus: &EventBus, mut session: CallSession) -> JoinHandle<()> {
    let mut subscriber = bus.subscribe();

    tokio::spawn(async move {
        while let Some(event) = subscriber.recv().await {
            match event {
                Event::Session(SessionAction::Start { number }) => session.start(&number).await,
                Event::Session(SessionAction::Stop) => session.stop().await,
                Event::Session(SessionAction::StateChanged(_)) => {}
                Event::Connection(event) => session.handle_connection_event(&event),
            }
        }
    })
}
