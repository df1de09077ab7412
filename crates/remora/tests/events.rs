//! Event bridge: callback shapes, ordering and unsubscribe behaviour.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use remora::{Error, EventHandler, ObjectProxy, Value};

use common::{connected, world};

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    (Arc::clone(&seen), seen)
}

#[tokio::test]
async fn test_payload_callback_receives_payload_once() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let (seen, sink) = recorder::<i64>();

    deck.events()
        .subscribe(
            "ItemsAdded",
            EventHandler::payload(move |count: i64| sink.lock().unwrap().push(count)),
        )
        .await
        .unwrap();

    assert_eq!(world.target.fire(world.deck.id, "ItemsAdded", Value::Int(4)), 1);
    assert_eq!(*seen.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn test_zero_arg_callback_ignores_payload() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    deck.events()
        .subscribe(
            "Saved",
            EventHandler::none(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    world.target.fire(world.deck.id, "Saved", Value::Null);
    world.target.fire(world.deck.id, "Saved", Value::from("unexpected payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_sender_payload_callback_gets_live_sender() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let (seen, sink) = recorder::<(ObjectProxy, i64)>();

    deck.events()
        .subscribe(
            "ItemsAdded",
            EventHandler::sender_payload(move |sender: ObjectProxy, count: i64| {
                sink.lock().unwrap().push((sender, count))
            }),
        )
        .await
        .unwrap();
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(2));

    let (sender, count) = seen.lock().unwrap().pop().unwrap();
    assert_eq!(count, 2);
    assert_eq!(sender.id(), world.deck.id);
    assert_eq!(sender.type_name(), "Deck");
    assert_eq!(sender.get::<String>("Name").await.unwrap(), "Mono Green");
}

#[tokio::test]
async fn test_dynamic_callbacks_by_arity() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let bridge = deck.events();
    let (seen, _) = recorder::<(usize, Vec<Value>)>();

    for arity in 0..=2 {
        let sink = Arc::clone(&seen);
        bridge
            .subscribe(
                "ItemsAdded",
                EventHandler::dynamic(arity, move |args| sink.lock().unwrap().push((arity, args))),
            )
            .await
            .unwrap();
    }
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(9));

    let mut calls = seen.lock().unwrap().clone();
    calls.sort_by_key(|(arity, _)| *arity);
    assert_eq!(
        calls,
        vec![
            (0, vec![]),
            (1, vec![Value::Int(9)]),
            (2, vec![Value::Object(world.deck.clone()), Value::Int(9)]),
        ]
    );
}

#[tokio::test]
async fn test_three_parameter_callback_rejected_at_subscribe() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();

    let err = deck
        .events()
        .subscribe("ItemsAdded", EventHandler::dynamic(3, |_| {}))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Argument(_)), "got {err:?}");
    assert_eq!(world.target.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscribing_to_a_property_is_rejected() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();

    let err = deck
        .events()
        .subscribe("ItemCount", EventHandler::none(|| {}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Argument(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let bridge = deck.events();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let token = bridge
        .subscribe(
            "ItemsAdded",
            EventHandler::payload(move |_: i64| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(1));
    assert!(bridge.is_subscribed(token));

    bridge.unsubscribe(token).await;
    assert!(!bridge.is_subscribed(token));
    assert_eq!(world.target.subscription_count(), 0);
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A second unsubscribe is a no-op.
    bridge.unsubscribe(token).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_any_bridge_can_unsubscribe_a_token() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    // Subscribed through a bridge that is dropped right away.
    let token = deck
        .events()
        .subscribe(
            "Saved",
            EventHandler::none(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    assert!(deck.events().is_subscribed(token));
    assert_eq!(deck.events().len(), 1);

    // Another proxy for the same object, and even a bridge on a different
    // object of the session, reach the same registration.
    let user = session.root("CurrentUser").await.unwrap();
    assert_eq!(user.events().len(), 0);
    user.events().unsubscribe(token).await;

    assert!(!deck.events().is_subscribed(token));
    assert_eq!(world.target.subscription_count(), 0);
    world.target.fire(world.deck.id, "Saved", Value::Null);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tokens_do_not_cross_sessions() {
    let world = world();
    let first = connected(&world).await;
    let second = connected(&world).await;
    let deck = first.root("ActiveDeck").await.unwrap();
    let other = second.root("ActiveDeck").await.unwrap();

    let token = deck
        .events()
        .subscribe("Saved", EventHandler::none(|| {}))
        .await
        .unwrap();
    other.events().unsubscribe(token).await;

    assert!(deck.events().is_subscribed(token));
    assert_eq!(world.target.subscription_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_leaves_other_subscriptions() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let bridge = deck.events();
    let (seen, _) = recorder::<&'static str>();

    let first_sink = Arc::clone(&seen);
    let first = bridge
        .subscribe(
            "ItemsAdded",
            EventHandler::none(move || first_sink.lock().unwrap().push("first")),
        )
        .await
        .unwrap();
    let second_sink = Arc::clone(&seen);
    bridge
        .subscribe(
            "ItemsAdded",
            EventHandler::none(move || second_sink.lock().unwrap().push("second")),
        )
        .await
        .unwrap();

    bridge.unsubscribe(first).await;
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(1));

    assert_eq!(*seen.lock().unwrap(), vec!["second"]);
    assert_eq!(bridge.len(), 1);
}

#[tokio::test]
async fn test_bad_payload_is_dropped_not_fatal() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let (seen, sink) = recorder::<i64>();

    deck.events()
        .subscribe(
            "ItemsAdded",
            EventHandler::payload(move |count: i64| sink.lock().unwrap().push(count)),
        )
        .await
        .unwrap();

    world.target.fire(world.deck.id, "ItemsAdded", Value::from("three"));
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(3));
    assert_eq!(*seen.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn test_one_subscription_never_runs_concurrently() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));

    let (r, o, d) = (Arc::clone(&running), Arc::clone(&overlaps), Arc::clone(&delivered));
    deck.events()
        .subscribe(
            "ItemsAdded",
            EventHandler::payload(move |_: i64| {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(2));
                r.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    let firers: Vec<_> = (0..4)
        .map(|_| {
            let target = world.target.clone();
            let deck = world.deck.id;
            std::thread::spawn(move || {
                for n in 0..5 {
                    target.fire(deck, "ItemsAdded", Value::Int(n));
                }
            })
        })
        .collect();
    for firer in firers {
        firer.join().unwrap();
    }

    assert_eq!(delivered.load(Ordering::SeqCst), 20);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_per_subscription_order_is_preserved() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let (seen, sink) = recorder::<i64>();

    deck.events()
        .subscribe(
            "ItemsAdded",
            EventHandler::payload(move |n: i64| sink.lock().unwrap().push(n)),
        )
        .await
        .unwrap();
    for n in 0..10 {
        world.target.fire(world.deck.id, "ItemsAdded", Value::Int(n));
    }

    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_no_delivery_after_dispose() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    deck.events()
        .subscribe(
            "Saved",
            EventHandler::none(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    session.dispose();
    // The channel may still hold the sink until release finishes.
    world.target.fire(world.deck.id, "Saved", Value::Null);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = deck
        .events()
        .subscribe("Saved", EventHandler::none(|| {}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disposed), "got {err:?}");
}

#[tokio::test]
async fn test_unsubscribe_all_clears_the_bridge() {
    let world = world();
    let session = connected(&world).await;
    let deck = session.root("ActiveDeck").await.unwrap();
    let bridge = deck.events();
    let calls = Arc::new(AtomicUsize::new(0));

    for event in ["ItemsAdded", "Saved"] {
        let counter = Arc::clone(&calls);
        bridge
            .subscribe(
                event,
                EventHandler::none(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
    }
    assert_eq!(bridge.len(), 2);

    bridge.unsubscribe_all().await;
    assert!(bridge.is_empty());
    assert_eq!(world.target.subscription_count(), 0);
    world.target.fire(world.deck.id, "ItemsAdded", Value::Int(1));
    world.target.fire(world.deck.id, "Saved", Value::Null);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
