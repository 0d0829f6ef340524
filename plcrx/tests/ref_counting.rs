//! Registration ref-counting, replay and ordering.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use plcrx::{Subscription, TransmissionMode, Value, ValueType};
use plcrx_transport::{NotificationHandle, RawNotification};
use proptest::prelude::*;

use common::{client, plc, var, Recorder, INTERVAL};

// ============================================================================
// Shared registration
// ============================================================================

#[test]
fn test_var1_lifecycle() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    assert_eq!(transport.counts().register, 0);

    let recorder = Recorder::new();
    let subscription = stream.subscribe(recorder.clone()).unwrap();
    assert_eq!(transport.counts().register, 1);
    let handle = stream.handle().expect("first subscriber registers");

    transport.set("MAIN.var1", Value::Int(42));
    assert_eq!(recorder.values(), vec![0, 42]);

    subscription.dispose();
    assert_eq!(transport.counts().delete, 1);
    assert_eq!(transport.deleted_handles(), vec![handle]);
    assert!(transport.active_registrations().is_empty());

    // A later subscriber starts a fresh registration
    let again = Recorder::new();
    let _subscription = stream.subscribe(again.clone()).unwrap();
    assert_eq!(transport.counts().register, 2);
    assert_eq!(again.values(), vec![42]);
}

#[test]
fn test_repeated_dispose_deletes_once() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    let first = stream.subscribe_fn(|_| {}).unwrap();
    let second = stream.subscribe_fn(|_| {}).unwrap();

    // Disposing one subscriber twice must not release the other's share
    second.dispose();
    second.dispose();
    assert!(second.is_disposed());
    assert_eq!(stream.subscriber_count(), 1);
    assert_eq!(transport.counts().delete, 0);

    first.dispose();
    first.dispose();
    drop(first);
    drop(second);
    assert_eq!(transport.counts().register, 1);
    assert_eq!(transport.counts().delete, 1);
    assert!(transport.active_registrations().is_empty());
}

#[test]
fn test_three_subscribers_share_one_registration() {
    let (transport, client) = client();
    let recorders: Vec<_> = (0..3).map(|_| common::Recorder::<i16>::new()).collect();

    // Separately obtained streams for the same identity
    let subscriptions: Vec<Subscription> = recorders
        .iter()
        .map(|r| var(&client, "MAIN.var1").subscribe(r.clone()).unwrap())
        .collect();

    assert_eq!(transport.counts().register, 1);
    assert_eq!(transport.listener_count(), 1);

    transport.set("MAIN.var1", Value::Int(7));
    for recorder in &recorders {
        assert_eq!(recorder.values().last(), Some(&7));
    }

    let mut subscriptions = subscriptions.into_iter();
    subscriptions.next().unwrap().dispose();
    subscriptions.next().unwrap().dispose();
    assert_eq!(transport.counts().delete, 0);

    subscriptions.next().unwrap().dispose();
    assert_eq!(transport.counts().delete, 1);
    assert_eq!(transport.listener_count(), 0);
}

#[test]
fn test_mode_and_interval_are_separate_streams() {
    let (transport, client) = client();
    let on_change = client.observe::<i16>("MAIN.var1", TransmissionMode::OnChange, INTERVAL);
    let cyclic = client.observe::<i16>("MAIN.var1", TransmissionMode::Cyclic, INTERVAL);
    let slower = client.observe::<i16>("MAIN.var1", TransmissionMode::OnChange, INTERVAL * 2);

    let _a = on_change.subscribe_fn(|_| {}).unwrap();
    let _b = cyclic.subscribe_fn(|_| {}).unwrap();
    let _c = slower.subscribe_fn(|_| {}).unwrap();

    assert_eq!(transport.counts().register, 3);
    assert_eq!(transport.active_registrations().len(), 3);
    // Still one feed listener for the whole session
    assert_eq!(transport.listener_count(), 1);
}

#[test]
fn test_raw_and_typed_views_register_separately() {
    let (transport, client) = client();
    let typed = var(&client, "MAIN.var1");
    let raw = client.observe_raw("MAIN.var1", ValueType::Int, TransmissionMode::OnChange, INTERVAL);

    let raw_values = Recorder::new();
    let _typed = typed.subscribe_fn(|_| {}).unwrap();
    let _raw = raw.subscribe(raw_values.clone()).unwrap();

    transport.set("MAIN.var1", Value::Int(3));
    assert_eq!(raw_values.values(), vec![Value::Int(0), Value::Int(3)]);
    assert_eq!(transport.counts().register, 2);
}

// ============================================================================
// Replay latest
// ============================================================================

#[test]
fn test_late_subscriber_gets_latest_immediately() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    let early = Recorder::new();
    let _early = stream.subscribe(early.clone()).unwrap();

    transport.set("MAIN.var1", Value::Int(5));
    transport.set("MAIN.var1", Value::Int(6));

    let late = Recorder::new();
    let _late = stream.subscribe(late.clone()).unwrap();
    assert_eq!(late.values(), vec![6]);
    assert_eq!(stream.latest(), Some(6));

    transport.set("MAIN.var1", Value::Int(7));
    assert_eq!(early.values(), vec![0, 5, 6, 7]);
    assert_eq!(late.values(), vec![6, 7]);
}

#[test]
fn test_latest_cleared_when_last_subscriber_leaves() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    transport.set_initial_notification(false);

    let subscription = stream.subscribe_fn(|_| {}).unwrap();
    transport.set("MAIN.var1", Value::Int(9));
    assert_eq!(stream.latest(), Some(9));

    drop(subscription);
    assert_eq!(stream.latest(), None);

    let fresh = Recorder::new();
    let _fresh = stream.subscribe(fresh.clone()).unwrap();
    assert!(fresh.values().is_empty());
}

// ============================================================================
// In-flight buffering
// ============================================================================

#[test]
fn test_notifications_during_registration_are_replayed_in_order() {
    let transport = plc(100);
    let client = plcrx::PlcRxClient::new(transport.clone());
    let stream = var(&client, "MAIN.var1");

    // Runs inside register_notification, before the handle is returned
    let weak = Arc::downgrade(&transport);
    let fired = AtomicBool::new(false);
    transport.on_register(move |_| {
        if !fired.swap(true, Ordering::SeqCst) {
            if let Some(transport) = weak.upgrade() {
                transport.emit(RawNotification::value(NotificationHandle::new(100), Value::Int(5)));
                transport.emit(RawNotification::value(NotificationHandle::new(999), Value::Int(6)));
            }
        }
    });

    let recorder = Recorder::new();
    let _subscription = stream.subscribe(recorder.clone()).unwrap();

    // The early notification, then the device's initial value; the foreign
    // handle is filtered out
    assert_eq!(recorder.values(), vec![5, 0]);
    assert_eq!(stream.handle(), Some(NotificationHandle::new(100)));
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_values_arrive_in_transport_order() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    let recorder = Recorder::new();
    let _subscription = stream.subscribe(recorder.clone()).unwrap();

    for i in 1..=100 {
        transport.set("MAIN.var1", Value::Int(i));
    }

    let expected: Vec<i16> = (0..=100).collect();
    assert_eq!(recorder.values(), expected);
}

#[test]
fn test_late_subscriber_never_sees_stale_replay() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    let _anchor = stream.subscribe_fn(|_| {}).unwrap();

    let producer = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || {
            for i in 1..=2000 {
                transport.set("MAIN.var1", Value::Int(i));
            }
        })
    };

    let mut late = Vec::new();
    for _ in 0..20 {
        let recorder = Recorder::new();
        late.push((stream.subscribe(recorder.clone()).unwrap(), recorder));
        thread::yield_now();
    }
    producer.join().unwrap();

    for (_, recorder) in &late {
        let values = recorder.values();
        assert!(
            values.windows(2).all(|w| w[0] < w[1]),
            "values out of order: {:?}",
            values
        );
    }
}

// ============================================================================
// Property: registrations follow subscriber count transitions
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Subscribe,
    Dispose(usize),
    Emit(i16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Subscribe),
        3 => any::<usize>().prop_map(Op::Dispose),
        2 => any::<i16>().prop_map(Op::Emit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_register_and_delete_track_transitions(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (transport, client) = client();
        let stream = var(&client, "MAIN.var1");

        let mut live: Vec<Subscription> = Vec::new();
        let mut rises = 0u32;
        let mut falls = 0u32;

        for op in ops {
            match op {
                Op::Subscribe => {
                    if live.is_empty() {
                        rises += 1;
                    }
                    live.push(stream.subscribe_fn(|_| {}).unwrap());
                }
                Op::Dispose(index) => {
                    if !live.is_empty() {
                        let subscription = live.remove(index % live.len());
                        subscription.dispose();
                        if live.is_empty() {
                            falls += 1;
                        }
                    }
                }
                Op::Emit(value) => transport.set("MAIN.var1", Value::Int(value)),
            }

            prop_assert_eq!(stream.subscriber_count(), live.len());
            prop_assert_eq!(stream.is_active(), !live.is_empty());
            prop_assert!(transport.active_registrations().len() <= 1);
        }

        let counts = transport.counts();
        prop_assert_eq!(counts.register, rises);
        prop_assert_eq!(counts.delete, falls);
        prop_assert_eq!(transport.listener_count(), usize::from(!live.is_empty()));
    }
}
