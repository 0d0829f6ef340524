//! Blocking and async consumers of variable streams.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::StreamExt;
use plcrx::{RxError, TransmissionMode, Value};
use plcrx_transport::TransportError;

use common::{client, var, INTERVAL};

#[test]
fn test_blocking_iter_receives_values() {
    let (transport, client) = client();
    let iter = var(&client, "MAIN.var1").iter().unwrap();

    let producer = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || {
            for i in 1..=3 {
                transport.set("MAIN.var1", Value::Int(i));
            }
        })
    };
    producer.join().unwrap();

    let values: Vec<i16> = iter
        .timeout_iter(Duration::from_millis(100))
        .map(|item| item.unwrap())
        .collect();
    assert_eq!(values, vec![0, 1, 2, 3]);
}

#[test]
fn test_dropping_iter_deletes_registration() {
    let (transport, client) = client();
    let stream = var(&client, "MAIN.var1");
    let iter = stream.iter().unwrap();
    assert!(stream.is_active());

    drop(iter);
    assert!(!stream.is_active());
    assert_eq!(transport.counts().delete, 1);
}

#[test]
fn test_iter_ends_after_terminal_error() {
    let (_, client) = client();
    let iter = var(&client, "MAIN.varNonExist").iter().unwrap();

    let items: Vec<_> = iter.try_iter().collect();
    assert!(matches!(
        items.as_slice(),
        [Err(RxError::Registration {
            source: TransportError::UnknownVariable(_),
            ..
        })]
    ));
    assert!(iter.recv().is_none());
}

#[tokio::test]
async fn test_async_values() {
    let (transport, client) = client();
    let mut values = client
        .observe::<String>("MAIN.message", TransmissionMode::OnChange, INTERVAL)
        .values()
        .unwrap();

    transport.set("MAIN.message", Value::String("hello".to_string()));

    assert_eq!(values.next().await, Some(Ok(String::new())));
    assert_eq!(values.next().await, Some(Ok("hello".to_string())));
}

#[tokio::test]
async fn test_async_values_close_after_error() {
    let (_, client) = client();
    let mut values = var(&client, "MAIN.varNonExist").values().unwrap();

    assert!(matches!(values.recv().await, Err(RxError::Registration { .. })));
    assert_eq!(values.recv().await, Err(RxError::Closed));
}

#[test]
fn test_concurrent_subscribe_and_dispose() {
    let (transport, client) = client();
    let client = Arc::new(client);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for _ in 0..50 {
                    let subscription = var(&client, "MAIN.var1").subscribe_fn(|_| {}).unwrap();
                    drop(subscription);
                }
            })
        })
        .collect();

    let producer = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || {
            for i in 0..500 {
                transport.set("MAIN.var1", Value::Int(i));
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    producer.join().unwrap();

    let counts = transport.counts();
    assert_eq!(counts.register, counts.delete);
    assert!(transport.active_registrations().is_empty());
    assert_eq!(transport.listener_count(), 0);
}
