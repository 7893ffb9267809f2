//! Unit tests for the event module

#[cfg(test)]
mod tests {
    use crate::connection::{ConnectionEvent, ConnectionState};
    use crate::event::{Event, EventBus};
    use crate::session::{SessionAction, SessionState};
    use std::time::Duration;

    #[test]
    fn test_send_without_subscribers() {
        let bus = EventBus::new();
        bus.send(Event::Session(SessionAction::Stop));
    }

    #[test]
    fn test_event_bus_send_receive() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();

        bus.send(Event::Session(SessionAction::Start {
            number: "+15551234567".to_string(),
        }));

        if let Ok(Event::Session(SessionAction::Start { number })) = subscriber.try_recv() {
            assert_eq!(number, "+15551234567");
        } else {
            panic!("Expected SessionAction::Start");
        }
    }

    #[test]
    fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        bus.send(Event::Connection(ConnectionEvent::CallEnded { generation: 3 }));

        assert!(sub1.try_recv().is_ok());
        assert!(sub2.try_recv().is_ok());
    }

    #[test]
    fn test_event_bus_empty_try_recv() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();

        assert!(subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_bus_async_recv() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();

        let bus_clone = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bus_clone.send(Event::Connection(ConnectionEvent::StateChanged {
                generation: 1,
                state: ConnectionState::Listening,
                reason: None,
            }));
        });

        let event = subscriber.recv().await;

        assert!(matches!(
            event,
            Some(Event::Connection(ConnectionEvent::StateChanged {
                state: ConnectionState::Listening,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_is_dropped() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();
        drop(bus);

        assert!(subscriber.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();

        for generation in 0..300 {
            bus.send(Event::Connection(ConnectionEvent::CallEnded { generation }));
        }

        // Oldest events are gone, the subscriber resumes with what is left
        match subscriber.recv().await {
            Some(Event::Connection(ConnectionEvent::CallEnded { generation })) => {
                assert!(generation > 0)
            }
            other => panic!("Expected CallEnded, got {other:?}"),
        }
    }

    #[test]
    fn test_event_debug() {
        let event = Event::Session(SessionAction::StateChanged(SessionState::Failed(
            "boom".to_string(),
        )));
        let debug = format!("{:?}", event);
        assert!(debug.contains("Session"));
        assert!(debug.contains("boom"));
    }

    #[test]
    fn test_event_bus_clone() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        let mut sub = bus1.subscribe();

        bus2.send(Event::Session(SessionAction::Stop));

        assert!(sub.try_recv().is_ok());
    }
}
