//! Relay interface tests.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use handoff::relay::{CheckoutState, MessageHandler, MessageType, Relay, RelayMessage, Target};
use handoff::snapshot::{Payload, SaveCause, Snapshot};

pub fn make_snapshot(owner: Uuid, data: &[u8]) -> Snapshot {
    Snapshot::builder(owner, Payload::new(1, data.to_vec()))
        .save_cause(SaveCause::ServerSwitch)
        .server_name("contract")
        .build()
}

/// Records every message delivered to it.
#[derive(Clone, Default)]
pub struct Collector {
    received: Arc<Mutex<Vec<RelayMessage>>>,
}

impl Collector {
    pub async fn kinds(&self) -> Vec<MessageType> {
        self.received.lock().await.iter().map(|m| m.kind).collect()
    }
}

impl MessageHandler for Collector {
    fn handle(&self, message: RelayMessage) -> BoxFuture<'static, ()> {
        let received = self.received.clone();
        Box::pin(async move {
            received.lock().await.push(message);
        })
    }
}

// =============================================================================
// Hand-off cache
// =============================================================================

pub async fn test_handoff_is_consume_once<R: Relay>(first: &R, second: &R) {
    let user = Uuid::new_v4();
    let snapshot = make_snapshot(user, b"handoff");
    first
        .set_user_data(user, &snapshot, Duration::from_secs(10))
        .await
        .expect("set_user_data should succeed");

    assert_eq!(second.take_user_data(user).await.unwrap(), Some(snapshot));
    assert_eq!(second.take_user_data(user).await.unwrap(), None);
    assert_eq!(first.take_user_data(user).await.unwrap(), None);
}

pub async fn test_handoff_expires<R: Relay>(first: &R, second: &R) {
    let user = Uuid::new_v4();
    first
        .set_user_data(user, &make_snapshot(user, b"stale"), Duration::from_secs(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(second.take_user_data(user).await.unwrap(), None);
}

pub async fn test_server_switch_is_consume_once<R: Relay>(first: &R, second: &R) {
    let user = Uuid::new_v4();
    assert!(!second.take_server_switch(user).await.unwrap());
    first
        .set_server_switch(user, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(second.take_server_switch(user).await.unwrap());
    assert!(!second.take_server_switch(user).await.unwrap());
}

// =============================================================================
// Checkout flags
// =============================================================================

pub async fn test_try_check_out_is_exclusive<R: Relay>(first: &R, second: &R) {
    for _ in 0..20 {
        let user = Uuid::new_v4();
        let (a, b) = tokio::join!(first.try_check_out(user), second.try_check_out(user));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one process may claim the user");

        let winner = if a { first } else { second };
        assert_eq!(
            first.get_checked_out(user).await.unwrap(),
            CheckoutState::Claimed(winner.server_name().to_string())
        );

        // Later tests sweep by server name.
        assert!(winner.release_checkout(user).await.unwrap());
    }
    assert!(first
        .clear_checked_out_for_server(first.server_name())
        .await
        .unwrap()
        .is_empty());
    assert!(second
        .clear_checked_out_for_server(second.server_name())
        .await
        .unwrap()
        .is_empty());
}

pub async fn test_release_only_own_claim<R: Relay>(first: &R, second: &R) {
    let user = Uuid::new_v4();
    assert!(first.try_check_out(user).await.unwrap());
    assert!(!second.try_check_out(user).await.unwrap());

    assert!(!second.release_checkout(user).await.unwrap());
    assert!(first.get_checked_out(user).await.unwrap().is_claimed());

    assert!(first.release_checkout(user).await.unwrap());
    assert_eq!(
        second.get_checked_out(user).await.unwrap(),
        CheckoutState::Unclaimed
    );
    assert!(second.try_check_out(user).await.unwrap());
    assert!(second.release_checkout(user).await.unwrap());
}

pub async fn test_set_checked_out<R: Relay>(first: &R, second: &R) {
    let user = Uuid::new_v4();
    first.set_checked_out(user, true).await.unwrap();
    assert_eq!(
        second.get_checked_out(user).await.unwrap(),
        CheckoutState::Claimed(first.server_name().to_string())
    );
    second.set_checked_out(user, false).await.unwrap();
    assert_eq!(
        first.get_checked_out(user).await.unwrap(),
        CheckoutState::Unclaimed
    );
}

pub async fn test_clear_for_server_sweeps_only_that_server<R: Relay>(first: &R, second: &R) {
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    assert!(first.try_check_out(a).await.unwrap());
    assert!(first.try_check_out(b).await.unwrap());
    assert!(second.try_check_out(c).await.unwrap());

    let mut released = second
        .clear_checked_out_for_server(first.server_name())
        .await
        .unwrap();
    released.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(released, expected);

    assert_eq!(first.get_checked_out(a).await.unwrap(), CheckoutState::Unclaimed);
    assert_eq!(first.get_checked_out(b).await.unwrap(), CheckoutState::Unclaimed);
    assert!(first.get_checked_out(c).await.unwrap().is_claimed());

    assert!(second.release_checkout(c).await.unwrap());
}

// =============================================================================
// Pub/sub
// =============================================================================

pub async fn test_publish_reaches_other_servers_only<R: Relay>(first: &R, second: &R) {
    let seen_by_first = Collector::default();
    let seen_by_second = Collector::default();
    first.subscribe(Arc::new(seen_by_first.clone())).await.unwrap();
    second.subscribe(Arc::new(seen_by_second.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let message = RelayMessage::new(MessageType::Handshake, first.server_name(), Target::Cluster);
    first.publish(message).await.unwrap();

    for _ in 0..100 {
        if !seen_by_second.kinds().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen_by_second.kinds().await, vec![MessageType::Handshake]);
    assert!(seen_by_first.kinds().await.is_empty(), "own messages are dropped");
}

/// Run all Relay contract tests.
#[macro_export]
macro_rules! run_relay_tests {
    ($first:expr, $second:expr) => {{
        use $crate::relay::relay_tests::*;

        test_handoff_is_consume_once($first, $second).await;
        println!("  test_handoff_is_consume_once: PASSED");

        test_handoff_expires($first, $second).await;
        println!("  test_handoff_expires: PASSED");

        test_server_switch_is_consume_once($first, $second).await;
        println!("  test_server_switch_is_consume_once: PASSED");

        test_try_check_out_is_exclusive($first, $second).await;
        println!("  test_try_check_out_is_exclusive: PASSED");

        test_release_only_own_claim($first, $second).await;
        println!("  test_release_only_own_claim: PASSED");

        test_set_checked_out($first, $second).await;
        println!("  test_set_checked_out: PASSED");

        test_clear_for_server_sweeps_only_that_server($first, $second).await;
        println!("  test_clear_for_server_sweeps_only_that_server: PASSED");

        // Subscribes both relays; keep last.
        test_publish_reaches_other_servers_only($first, $second).await;
        println!("  test_publish_reaches_other_servers_only: PASSED");
    }};
}
