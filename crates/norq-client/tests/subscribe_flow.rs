// Subscription lifecycle against the in-process broker and discovery
// doubles: reconcile, delivery, requeue, backoff, drain, teardown.
mod common;

use common::{MockLookupd, MockNsqd};
use norq_client::{failed_handler_fn, handler_fn, ClientConfig, Message, Subscriber};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> ClientConfig {
    ClientConfig {
        lookup_interval_secs: 3600,
        connect_timeout_millis: 2_000,
        backoff_base_millis: 100,
        ..ClientConfig::default()
    }
}

async fn eventually<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn subscribe_connects_to_every_discovered_node_and_unsubscribe_closes() {
    let nsqd_a = MockNsqd::start().await.expect("start nsqd a");
    let nsqd_b = MockNsqd::start().await.expect("start nsqd b");
    let lookupd = MockLookupd::start(vec![nsqd_a.addr, nsqd_b.addr])
        .await
        .expect("start lookupd");

    let subscriber = Subscriber::new(test_config(), &[lookupd.host().as_str()]).expect("new");
    assert_eq!(subscriber.connection_count().await, 0);

    let id = subscriber
        .subscribe("events", "workers", handler_fn(|_message: &Message| Ok(())))
        .await
        .expect("subscribe");
    assert_eq!(subscriber.connection_count().await, 2);
    assert_eq!(nsqd_a.count_command("SUB events workers"), 1);
    assert_eq!(nsqd_b.count_command("SUB events workers"), 1);

    assert!(subscriber.unsubscribe(id).await);
    assert_eq!(subscriber.connection_count().await, 0);
    assert_eq!(nsqd_a.count_command("CLS"), 1);
    assert_eq!(nsqd_b.count_command("CLS"), 1);

    assert!(!subscriber.unsubscribe(id).await);
    subscriber.stop().await;
}

#[tokio::test]
async fn delivered_messages_reach_the_handler_and_get_finished() {
    let nsqd = MockNsqd::start().await.expect("start nsqd");
    let lookupd = MockLookupd::start(vec![nsqd.addr]).await.expect("start lookupd");

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let subscriber = Subscriber::new(test_config(), &[lookupd.host().as_str()]).expect("new");
    subscriber
        .subscribe(
            "events",
            "workers",
            handler_fn(move |message: &Message| {
                recorded
                    .lock()
                    .expect("seen lock")
                    .push(message.data().to_vec());
                Ok(())
            }),
        )
        .await
        .expect("subscribe");

    nsqd.enqueue(1, b"first");
    nsqd.enqueue(1, b"second");

    let nsqd_ref = &nsqd;
    assert!(
        eventually(
            || async move { nsqd_ref.count_command("FIN") == 2 },
            Duration::from_secs(5)
        )
        .await,
        "both messages should be finished"
    );
    // Handlers run concurrently, so compare contents, not order.
    let mut payloads = seen.lock().expect("seen lock").clone();
    payloads.sort();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    assert_eq!(nsqd.count_command("REQ"), 0);
    subscriber.stop().await;
}

#[tokio::test]
async fn handler_failure_requeues_then_recovers() {
    let nsqd = MockNsqd::start().await.expect("start nsqd");
    let lookupd = MockLookupd::start(vec![nsqd.addr]).await.expect("start lookupd");

    let subscriber = Subscriber::new(test_config(), &[lookupd.host().as_str()]).expect("new");
    subscriber
        .subscribe(
            "events",
            "workers",
            handler_fn(|message: &Message| {
                if message.attempts() == 1 {
                    Err("first attempt always fails".into())
                } else {
                    Ok(())
                }
            }),
        )
        .await
        .expect("subscribe");

    nsqd.enqueue(1, b"flaky");

    let nsqd_ref = &nsqd;
    assert!(
        eventually(
            || async move { nsqd_ref.count_command("FIN") == 1 },
            Duration::from_secs(5)
        )
        .await,
        "message should eventually be finished"
    );
    assert_eq!(nsqd.count_command("REQ"), 1);
    // The failure paused delivery before the redelivery probe.
    assert!(nsqd.count_command("RDY 0") >= 1);
    subscriber.stop().await;
}

#[tokio::test]
async fn exhausted_messages_are_dead_lettered_and_finished() {
    let nsqd = MockNsqd::start().await.expect("start nsqd");
    let lookupd = MockLookupd::start(vec![nsqd.addr]).await.expect("start lookupd");

    let config = ClientConfig {
        max_attempts: 1,
        ..test_config()
    };
    let dead_lettered = Arc::new(AtomicUsize::new(0));
    let recorded = Arc::clone(&dead_lettered);
    let subscriber = Subscriber::new(config, &[lookupd.host().as_str()]).expect("new");
    subscriber.set_failed_message_handler(failed_handler_fn(move |_message: &Message| {
        recorded.fetch_add(1, Ordering::SeqCst);
    }));
    subscriber
        .subscribe(
            "events",
            "workers",
            handler_fn(|_message: &Message| Err("always fails".into())),
        )
        .await
        .expect("subscribe");

    nsqd.enqueue(1, b"poison");

    let nsqd_ref = &nsqd;
    assert!(
        eventually(
            || async move { nsqd_ref.count_command("FIN") == 1 },
            Duration::from_secs(5)
        )
        .await,
        "poison message should be finished away"
    );
    assert_eq!(nsqd.count_command("REQ"), 0);
    assert_eq!(dead_lettered.load(Ordering::SeqCst), 1);
    subscriber.stop().await;
}

#[tokio::test]
async fn drain_stops_delivery_and_await_reports_empty() {
    let nsqd = MockNsqd::start().await.expect("start nsqd");
    let lookupd = MockLookupd::start(vec![nsqd.addr]).await.expect("start lookupd");

    let handled = Arc::new(AtomicUsize::new(0));
    let recorded = Arc::clone(&handled);
    let subscriber = Subscriber::new(test_config(), &[lookupd.host().as_str()]).expect("new");
    subscriber
        .subscribe(
            "events",
            "workers",
            handler_fn(move |_message: &Message| {
                recorded.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1500));
                Ok(())
            }),
        )
        .await
        .expect("subscribe");

    for index in 0..5u8 {
        nsqd.enqueue(1, &[index]);
    }
    let in_flight_subscriber = Arc::clone(&subscriber);
    assert!(
        eventually(
            move || {
                let subscriber = Arc::clone(&in_flight_subscriber);
                async move { subscriber.current_in_flight().await == 5 }
            },
            Duration::from_secs(5)
        )
        .await,
        "all five messages should be in flight"
    );

    subscriber.drain_in_flight().await;
    nsqd.enqueue(1, b"late");

    assert!(
        subscriber
            .await_no_messages_in_flight(Duration::from_secs(10))
            .await,
        "handlers finish within the deadline"
    );
    assert_eq!(handled.load(Ordering::SeqCst), 5);

    // The drain is sticky: the late message stays undelivered.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 5);
    subscriber.stop().await;
}

#[tokio::test]
async fn empty_producer_list_removes_connections_on_next_poll() {
    let nsqd = MockNsqd::start().await.expect("start nsqd");
    let lookupd = MockLookupd::start(vec![nsqd.addr]).await.expect("start lookupd");

    let config = ClientConfig {
        lookup_interval_secs: 1,
        ..test_config()
    };
    let subscriber = Subscriber::new(config, &[lookupd.host().as_str()]).expect("new");
    subscriber
        .subscribe("events", "workers", handler_fn(|_message: &Message| Ok(())))
        .await
        .expect("subscribe");
    assert_eq!(subscriber.connection_count().await, 1);

    lookupd.set_producers(Vec::new());

    let poll_subscriber = Arc::clone(&subscriber);
    assert!(
        eventually(
            move || {
                let subscriber = Arc::clone(&poll_subscriber);
                async move { subscriber.connection_count().await == 0 }
            },
            Duration::from_secs(5)
        )
        .await,
        "connections should follow discovery"
    );
    assert!(nsqd.count_command("CLS") >= 1);
    subscriber.stop().await;
}

#[tokio::test]
async fn rdy_split_across_nodes_never_exceeds_max_in_flight() {
    let nsqd_a = MockNsqd::start().await.expect("start nsqd a");
    let nsqd_b = MockNsqd::start().await.expect("start nsqd b");
    let lookupd = MockLookupd::start(vec![nsqd_a.addr, nsqd_b.addr])
        .await
        .expect("start lookupd");

    let subscriber = Subscriber::new(test_config(), &[lookupd.host().as_str()]).expect("new");
    subscriber
        .subscribe_with_max_in_flight(
            "events",
            "workers",
            7,
            handler_fn(|_message: &Message| Ok(())),
        )
        .await
        .expect("subscribe");

    let last_rdy = |nsqd: &MockNsqd| {
        nsqd.commands()
            .iter()
            .rev()
            .find_map(|command| {
                command
                    .strip_prefix("RDY ")
                    .and_then(|count| count.parse::<u32>().ok())
            })
            .unwrap_or(0)
    };
    // The mock records commands asynchronously; wait for both announcements.
    let (a, b) = (&nsqd_a, &nsqd_b);
    assert!(
        eventually(
            || async move { last_rdy(a) + last_rdy(b) == 7 },
            Duration::from_secs(5)
        )
        .await,
        "announced credit must add up to max_in_flight"
    );
    assert!(last_rdy(&nsqd_a) <= 7 && last_rdy(&nsqd_b) <= 7);
    subscriber.stop().await;
}
