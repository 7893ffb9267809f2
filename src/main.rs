#[macro_use]
extern crate log;

use anyhow::Result;
use call_listen::{
    config,
    connection::{ConnectionHandle, StreamConnection},
    event::{self, Event, EventBus},
    origination::HttpOriginator,
    output,
    scheduler::PlaybackScheduler,
    session::{self, CallSession, SessionAction, SessionState},
    stdin,
};
use std::{sync::Arc, time::Duration};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let config = config::load().await?;

    let bus = EventBus::new();
    event::debug(&bus);

    let scheduler = PlaybackScheduler::new(config.sample_rate, output::factory(config.output));
    let connection = ConnectionHandle::spawn(
        &bus,
        StreamConnection::new(scheduler, config.reconnect_policy()),
    );
    let originator = Arc::new(HttpOriginator::new(config.origination_url.clone()));
    info!(
        "Using origination service {} at {} Hz",
        originator.url(),
        config.sample_rate
    );
    session::spawn(&bus, CallSession::new(&bus, originator, connection));

    if let Some(number) = std::env::args().nth(1) {
        bus.send(Event::Session(SessionAction::Start { number }));
    }

    tokio::select! {
        _ = stdin::run(&bus) => {}
        result = tokio::signal::ctrl_c() => result?,
    }

    // Let the session tear the stream down before the runtime goes away
    let mut subscriber = bus.subscribe();
    bus.send(Event::Session(SessionAction::Stop));
    let stopped = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(event) = subscriber.recv().await {
            if let Event::Session(SessionAction::StateChanged(SessionState::Idle)) = event {
                break;
            }
        }
    })
    .await;

    if stopped.is_err() {
        warn!("Timed out waiting for the session to stop");
    }

    Ok(())
}
