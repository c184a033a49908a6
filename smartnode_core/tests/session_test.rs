// Broker session behaviour across link failures
use std::io;
use std::time::Duration;

use smartnode_core::communication::packet::Packet;
use smartnode_core::communication::{
    BackoffPolicy, JitterPolicy, Message, QoS, Session, SessionConfig, SessionState,
    SimulatedBroker,
};
use tokio::sync::watch;
use tokio::task::LocalSet;
use tokio::time;

fn config() -> SessionConfig {
    SessionConfig {
        client_id: "n1".to_string(),
        keepalive: Duration::from_secs(20),
        backoff: BackoffPolicy {
            first: Duration::from_secs(1),
            max: Duration::from_secs(16),
            factor: 2.0,
            jitter: JitterPolicy::None,
        },
        availability_topic: Some("home/n1/status".to_string()),
        ..SessionConfig::default()
    }
}

fn index_of(packets: &[Packet], predicate: impl Fn(&Packet) -> bool) -> Option<usize> {
    packets.iter().position(predicate)
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_resubscribe_before_queued_publish() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(config(), broker.link(), shutdown);
            let handle = session.handle();
            handle
                .subscribe("home/+/status", QoS::AtLeastOnce, |_: Message| async {})
                .unwrap();
            tokio::task::spawn_local(session.run());

            handle.wait_for(SessionState::is_connected).await;
            assert_eq!(broker.subscribe_count("home/+/status"), 1);

            broker.clear_received();
            broker.fail_link(io::ErrorKind::ConnectionReset);
            let state = handle
                .wait_for(|s| matches!(s, SessionState::Reconnecting { .. }))
                .await;
            assert_eq!(
                state,
                SessionState::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_secs(1)
                }
            );

            handle.publish(Message::new("home/n1/distance", "42.0"));
            // same pattern again is not a new subscription
            handle
                .subscribe("home/+/status", QoS::AtLeastOnce, |_: Message| async {})
                .unwrap();
            assert_eq!(handle.pending(), 1);

            handle.wait_for(SessionState::is_connected).await;
            time::sleep(Duration::from_millis(10)).await;

            let packets = broker.received();
            assert_eq!(broker.subscribe_count("home/+/status"), 1);
            let subscribe = index_of(&packets, |p| matches!(p, Packet::Subscribe { .. })).unwrap();
            let queued = index_of(&packets, |p| {
                matches!(p, Packet::Publish(publish) if publish.message.topic == "home/n1/distance")
            })
            .unwrap();
            assert!(subscribe < queued);
            assert_eq!(handle.subscription_patterns(), vec!["home/+/status"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_loss_with_hung_peer() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(config(), broker.link(), shutdown);
            let handle = session.handle();
            tokio::task::spawn_local(session.run());

            handle.wait_for(SessionState::is_connected).await;
            broker.set_respond_to_pings(false);

            // ping at 20s, no answer by 20s * 1.5
            let left = time::timeout(
                Duration::from_secs(60),
                handle.wait_for(|s| !s.is_connected()),
            )
            .await;
            assert!(left.is_ok());
            assert!(broker
                .received()
                .iter()
                .any(|p| matches!(p, Packet::PingReq)));

            broker.set_respond_to_pings(true);
            handle.wait_for(SessionState::is_connected).await;
            assert_eq!(broker.connections(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_overflow_drops_oldest() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(
                SessionConfig {
                    pending_capacity: 3,
                    ..config()
                },
                broker.link(),
                shutdown,
            );
            let handle = session.handle();
            for i in 0..5 {
                handle.publish(Message::new("home/n1/seq", i.to_string()));
            }
            assert_eq!(handle.pending(), 3);
            assert_eq!(handle.dropped(), 2);

            tokio::task::spawn_local(session.run());
            handle.wait_for(SessionState::is_connected).await;
            time::sleep(Duration::from_millis(10)).await;

            let delivered: Vec<String> = broker
                .published()
                .iter()
                .filter(|m| m.topic == "home/n1/seq")
                .filter_map(|m| m.payload_str().map(str::to_string))
                .collect();
            assert_eq!(delivered, vec!["2", "3", "4"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_then_resets_on_success() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            broker.refuse_connections(3);
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(config(), broker.link(), shutdown);
            let handle = session.handle();
            tokio::task::spawn_local(session.run());

            handle.wait_for(SessionState::is_connected).await;
            let delays: Vec<Duration> = handle
                .transitions()
                .iter()
                .filter_map(|s| match s {
                    SessionState::Reconnecting { delay, .. } => Some(*delay),
                    _ => None,
                })
                .collect();
            assert_eq!(
                delays,
                vec![
                    Duration::from_secs(1),
                    Duration::from_secs(2),
                    Duration::from_secs(4)
                ]
            );

            broker.fail_link(io::ErrorKind::BrokenPipe);
            let state = handle
                .wait_for(|s| matches!(s, SessionState::Reconnecting { .. }))
                .await;
            assert_eq!(
                state,
                SessionState::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_secs(1)
                }
            );
            assert_eq!(broker.attempts(), 4);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_severed_link_leaves_will_and_birth_restores_online() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (stop, shutdown) = watch::channel(false);
            let session = Session::new(config(), broker.link(), shutdown);
            let handle = session.handle();
            let task = tokio::task::spawn_local(session.run());

            handle.wait_for(SessionState::is_connected).await;
            broker.sever();
            assert_eq!(
                broker.retained("home/n1/status").unwrap().payload_str(),
                Some("offline")
            );

            handle.wait_for(|s| !s.is_connected()).await;
            handle.wait_for(SessionState::is_connected).await;
            time::sleep(Duration::from_millis(10)).await;
            assert_eq!(
                broker.retained("home/n1/status").unwrap().payload_str(),
                Some("online")
            );

            stop.send_replace(true);
            task.await.unwrap().unwrap();
            assert_eq!(handle.state(), SessionState::Closed);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_connected_burst_larger_than_outbox_is_not_dropped() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(
                SessionConfig {
                    pending_capacity: 8,
                    ..config()
                },
                broker.link(),
                shutdown,
            );
            let handle = session.handle();
            tokio::task::spawn_local(session.run());
            handle.wait_for(SessionState::is_connected).await;

            for i in 0..100 {
                handle.publish(Message::new("home/n1/burst", i.to_string()));
            }
            assert_eq!(handle.pending(), 100);
            time::sleep(Duration::from_millis(50)).await;

            let delivered: Vec<String> = broker
                .published()
                .iter()
                .filter(|m| m.topic == "home/n1/burst")
                .filter_map(|m| m.payload_str().map(str::to_string))
                .collect();
            let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
            assert_eq!(delivered, expected);
            assert_eq!(handle.dropped(), 0);
            assert_eq!(handle.pending(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unsent_connected_publishes_survive_link_loss() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(config(), broker.link(), shutdown);
            let handle = session.handle();
            tokio::task::spawn_local(session.run());
            handle.wait_for(SessionState::is_connected).await;

            // queued while connected, link dies before the session gets a turn
            handle.publish(Message::new("home/n1/late", "1"));
            broker.fail_link(io::ErrorKind::ConnectionReset);
            handle
                .wait_for(|s| matches!(s, SessionState::Reconnecting { .. }))
                .await;

            handle.wait_for(SessionState::is_connected).await;
            time::sleep(Duration::from_millis(10)).await;
            let late = broker
                .published()
                .iter()
                .filter(|m| m.topic == "home/n1/late")
                .count();
            assert_eq!(late, 1);
            assert_eq!(handle.pending(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_publish_is_dropped_without_reconnect() {
    LocalSet::new()
        .run_until(async {
            let broker = SimulatedBroker::new();
            let (_stop, shutdown) = watch::channel(false);
            let session = Session::new(
                SessionConfig {
                    max_packet_size: 256,
                    ..config()
                },
                broker.link(),
                shutdown,
            );
            let handle = session.handle();
            tokio::task::spawn_local(session.run());
            handle.wait_for(SessionState::is_connected).await;

            handle.publish(Message::new("home/n1/blob", vec![0u8; 1024]));
            handle.publish(Message::new("t".repeat(70_000), "x"));
            handle.publish(Message::new("home/n1/small", "ok"));
            time::sleep(Duration::from_millis(50)).await;

            let topics: Vec<String> = broker
                .published()
                .into_iter()
                .map(|m| m.topic)
                .filter(|t| t != "home/n1/status")
                .collect();
            assert_eq!(topics, vec!["home/n1/small"]);
            let stats = handle.stats();
            assert_eq!(stats.rejected, 2);
            assert_eq!(stats.connections, 1);
            assert_eq!(broker.connections(), 1);
            assert_eq!(handle.pending(), 0);
            assert!(handle.state().is_connected());
        })
        .await;
}
