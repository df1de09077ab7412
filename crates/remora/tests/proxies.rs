//! Proxy dispatch, casting into typed wrappers, and the safe-call helpers.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use remora::{remote_contract, try_safe, Error, ErrorCode, Result, Session, Value};

use common::{connected, world};

remote_contract! {
    /// A player account.
    pub struct User;
}

remote_contract! {
    pub struct Avatar;
}

remote_contract! {
    /// A deck or other named card collection.
    pub struct Deck;
}

remote_contract! {
    pub struct PlayFormat;
}

impl User {
    async fn name(&self) -> Result<String> {
        self.proxy().get("Name").await
    }

    async fn avatar(&self) -> Result<Avatar> {
        self.proxy().get("Avatar").await
    }

    async fn last_login(&self) -> Result<Option<String>> {
        self.proxy().try_get("LastLogin").await
    }
}

impl Avatar {
    async fn name(&self) -> Result<String> {
        self.proxy().get("Name").await
    }
}

impl Deck {
    async fn format(&self) -> Result<Option<PlayFormat>> {
        self.proxy().get("Format").await
    }

    async fn item_count(&self) -> Result<i64> {
        self.proxy().get("ItemCount").await
    }

    async fn item_ids(&self) -> Result<Vec<i64>> {
        self.proxy().get("ItemIds").await
    }

    async fn add_items(&self, id: i64, quantity: i64) -> Result<i64> {
        self.proxy()
            .invoke("AddItems", vec![Value::Int(id), Value::Int(quantity)])
            .await
    }
}

impl PlayFormat {
    async fn code(&self) -> Result<String> {
        self.proxy().get("Code").await
    }
}

async fn current_user(session: &Session) -> User {
    User::from(session.root("CurrentUser").await.unwrap())
}

async fn active_deck(session: &Session) -> Deck {
    Deck::from(session.root("ActiveDeck").await.unwrap())
}

#[tokio::test]
async fn test_property_holding_an_object_yields_a_live_proxy() {
    let world = world();
    let session = connected(&world).await;
    let user = current_user(&session).await;

    assert_eq!(user.name().await.unwrap(), "Karn");
    let avatar = user.avatar().await.unwrap();
    assert_eq!(avatar.proxy().id(), world.avatar.id);
    assert_eq!(avatar.proxy().type_name(), "Avatar");
    assert_eq!(avatar.name().await.unwrap(), "Urza");

    // Not a snapshot: later changes in the target are visible.
    world
        .target
        .set_property(world.avatar.id, "Name", Value::from("Mishra"));
    assert_eq!(avatar.name().await.unwrap(), "Mishra");
}

#[tokio::test]
async fn test_nullable_object_property() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;

    let format = deck.format().await.unwrap().unwrap();
    assert_eq!(format.code().await.unwrap(), "CSTANDARD");

    world.target.set_property(world.deck.id, "Format", Value::Null);
    assert!(deck.format().await.unwrap().is_none());
}

#[tokio::test]
async fn test_invocations_observe_their_own_effects_in_order() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;

    assert_eq!(deck.add_items(71_204, 4).await.unwrap(), 4);
    assert_eq!(deck.add_items(71_210, 2).await.unwrap(), 6);
    assert_eq!(deck.item_count().await.unwrap(), 6);
    assert_eq!(deck.item_ids().await.unwrap(), vec![71_204, 71_210]);
}

#[tokio::test]
async fn test_argument_mismatch_fails_locally() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;

    let err = deck
        .proxy()
        .invoke_member("AddItems", vec![Value::Int(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Argument(_)), "got {err:?}");

    let err = deck
        .proxy()
        .invoke_member("AddItems", vec![Value::from("Forest"), Value::Int(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Argument(_)), "got {err:?}");
    assert_eq!(deck.item_count().await.unwrap(), 0);

    let err = deck.proxy().get_member("AddItems").await.unwrap_err();
    assert!(matches!(err, Error::Argument(_)), "got {err:?}");
}

#[tokio::test]
async fn test_remote_failures_carry_member_and_code() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;

    let err = deck
        .proxy()
        .invoke_member("Validate", vec![])
        .await
        .unwrap_err();
    match err {
        Error::RemoteCall {
            member,
            code,
            message,
        } => {
            assert_eq!(member, "Validate");
            assert_eq!(code, Some(ErrorCode::Exception));
            assert!(message.contains("NullReferenceException"));
        }
        other => panic!("expected a remote call error, got {other:?}"),
    }

    let err = deck.proxy().get_member("Sideboard").await.unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::MemberNotFound));
}

#[tokio::test]
async fn test_try_safe_only_downgrades_absence() {
    let world = world();
    let session = connected(&world).await;
    let user = current_user(&session).await;
    let deck = active_deck(&session).await;

    assert_eq!(user.last_login().await.unwrap(), None);
    world
        .target
        .set_property(world.user.id, "LastLogin", Value::from("2024-06-01"));
    assert_eq!(user.last_login().await.unwrap().as_deref(), Some("2024-06-01"));

    let missing: Option<Value> = try_safe(deck.proxy().get_member("Sideboard"))
        .await
        .unwrap();
    assert_eq!(missing, None);

    let err = try_safe(deck.proxy().invoke_member("Validate", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::Exception));

    let err = try_safe(deck.proxy().invoke_member("AddItems", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Argument(_)), "got {err:?}");
}

#[tokio::test]
async fn test_writes_respect_declared_writability() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;

    deck.proxy().set_member("Name", "Elves").await.unwrap();
    assert_eq!(
        world.target.property(world.deck.id, "Name"),
        Some(Value::from("Elves"))
    );

    let err = deck.proxy().set_member("ItemCount", 99).await.unwrap_err();
    assert!(matches!(err, Error::Argument(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_slow_call_times_out_without_breaking_session() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;
    deck.proxy().capabilities().await.unwrap();
    world.target.set_call_delay(Duration::from_secs(5));

    let err = deck.item_count().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    assert!(session.is_connected());

    world.target.set_call_delay(Duration::ZERO);
    assert_eq!(deck.item_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_wait_until_observes_remote_change() {
    let world = world();
    let session = connected(&world).await;
    let deck = active_deck(&session).await;

    let target = world.target.clone();
    let deck_id = world.deck.id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        target.set_property(deck_id, "ItemCount", Value::Int(60));
    });

    let filled = deck
        .proxy()
        .wait_until(
            |deck| async move { Ok(deck.get::<i64>("ItemCount").await? >= 60) },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(filled);

    let never = deck
        .proxy()
        .wait_until(
            |deck| async move { Ok(deck.get::<i64>("ItemCount").await? > 250) },
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert!(!never);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_condition_flips_after_two_intervals() {
    let interval = Duration::from_millis(100);
    let start = tokio::time::Instant::now();

    let done = Session::wait_for_condition(
        || start.elapsed() >= interval * 2,
        interval,
        interval * 3,
    )
    .await;

    assert!(done);
    assert!(start.elapsed() < interval * 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_condition_returns_false_on_budget() {
    let done = Session::wait_for_condition(
        || false,
        Duration::from_millis(100),
        Duration::from_millis(300),
    )
    .await;
    assert!(!done);
}

#[tokio::test]
async fn test_proxy_fails_after_session_disposed() {
    let world = world();
    let session = connected(&world).await;
    let user = current_user(&session).await;
    let avatar = user.avatar().await.unwrap();

    assert!(session.dispose_and_wait(Duration::from_secs(1)).await);

    assert!(matches!(user.name().await, Err(Error::Disposed)));
    assert!(matches!(avatar.name().await, Err(Error::Disposed)));
    assert!(matches!(user.last_login().await, Err(Error::Disposed)));
}

#[tokio::test]
async fn test_handle_round_trips_to_object_ref() {
    let world = world();
    let session = connected(&world).await;
    let user = current_user(&session).await;
    let avatar = user.avatar().await.unwrap();

    assert_eq!(avatar.proxy().handle().to_object_ref(), world.avatar);
    assert_eq!(avatar.proxy().handle().session(), session.id());
}

#[tokio::test]
async fn test_cleared_value_and_collected_object() {
    let world = world();
    let session = connected(&world).await;
    let user = current_user(&session).await;
    let avatar = user.avatar().await.unwrap();

    world
        .target
        .set_property(world.user.id, "LastLogin", Value::from("2024-06-01"));
    assert!(user.last_login().await.unwrap().is_some());
    world.target.clear_property(world.user.id, "LastLogin");
    assert_eq!(user.last_login().await.unwrap(), None);

    // A proxy does not keep its object alive in the target.
    world.target.remove_object(world.avatar.id);
    let err = avatar.name().await.unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::ObjectNotFound));
    assert!(!err.is_expected_absence());
}
