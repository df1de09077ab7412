//! A small client-like object graph shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use remora::{MemberInfo, ObjectRef, Session, SessionOptions, TypeInfo, Value, ValueKind};
use remora_channel::memory::MemoryTarget;

pub const USERNAME: &str = "karn";
pub const PASSWORD: &str = "silver-golem";

pub struct World {
    pub target: MemoryTarget,
    pub user: ObjectRef,
    pub avatar: ObjectRef,
    pub deck: ObjectRef,
    pub format: ObjectRef,
}

/// Options with budgets short enough for tests.
pub fn options() -> SessionOptions {
    SessionOptions {
        connect_timeout: Duration::from_secs(2),
        auth_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(1),
        dispose_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
        ..SessionOptions::default()
    }
}

pub fn world() -> World {
    let target = MemoryTarget::new();
    target.set_credentials(USERNAME, PASSWORD);

    target.define_type(TypeInfo {
        name: "User".into(),
        members: vec![
            MemberInfo::property("Id", ValueKind::Int),
            MemberInfo::property("Name", ValueKind::String),
            MemberInfo::property("Avatar", ValueKind::Object("Avatar".into())),
            MemberInfo::property("IsGuest", ValueKind::Bool),
            MemberInfo::property("LastLogin", ValueKind::String),
            MemberInfo::event("NameChanged", ValueKind::String),
        ],
    });
    target.define_type(TypeInfo {
        name: "Avatar".into(),
        members: vec![
            MemberInfo::property("Id", ValueKind::Int),
            MemberInfo::property("Name", ValueKind::String),
        ],
    });
    target.define_type(TypeInfo {
        name: "Deck".into(),
        members: vec![
            MemberInfo::property("Id", ValueKind::Int),
            MemberInfo::writable_property("Name", ValueKind::String),
            MemberInfo::property("Format", ValueKind::Object("PlayFormat".into())),
            MemberInfo::property("ItemCount", ValueKind::Int),
            MemberInfo::property("ItemIds", ValueKind::List),
            MemberInfo::method("AddItems", vec![ValueKind::Int, ValueKind::Int], ValueKind::Int),
            MemberInfo::method("Validate", vec![], ValueKind::Bool),
            MemberInfo::event("ItemsAdded", ValueKind::Int),
            MemberInfo::event("Saved", ValueKind::Null),
        ],
    });
    target.define_type(TypeInfo {
        name: "PlayFormat".into(),
        members: vec![
            MemberInfo::property("Name", ValueKind::String),
            MemberInfo::property("Code", ValueKind::String),
        ],
    });

    let avatar = target.add_object("Avatar");
    target.set_property(avatar.id, "Id", Value::Int(1207));
    target.set_property(avatar.id, "Name", Value::from("Urza"));

    let user = target.add_object("User");
    target.set_property(user.id, "Id", Value::Int(4_250_116));
    target.set_property(user.id, "Name", Value::from("Karn"));
    target.set_property(user.id, "Avatar", Value::Object(avatar.clone()));
    target.set_property(user.id, "IsGuest", Value::Bool(false));

    let format = target.add_object("PlayFormat");
    target.set_property(format.id, "Name", Value::from("Standard"));
    target.set_property(format.id, "Code", Value::from("CSTANDARD"));

    let deck = target.add_object("Deck");
    target.set_property(deck.id, "Id", Value::Int(88));
    target.set_property(deck.id, "Name", Value::from("Mono Green"));
    target.set_property(deck.id, "Format", Value::Object(format.clone()));
    target.set_property(deck.id, "ItemCount", Value::Int(0));
    target.set_property(deck.id, "ItemIds", Value::List(Vec::new()));
    target.define_method(deck.id, "AddItems", |props, args| {
        let count = props.get("ItemCount").and_then(Value::as_i64).unwrap_or(0)
            + args[1].as_i64().unwrap_or(0);
        props.insert("ItemCount".into(), Value::Int(count));
        if let Some(Value::List(ids)) = props.get_mut("ItemIds") {
            ids.push(args[0].clone());
        }
        Ok(Value::Int(count))
    });
    target.define_method(deck.id, "Validate", |_, _| {
        Err(remora_channel::ChannelError::remote(
            remora::ErrorCode::Exception,
            "NullReferenceException: deck has no sideboard",
        ))
    });

    target.add_root("CurrentUser", user.id);
    target.add_root("ActiveDeck", deck.id);

    World {
        target,
        user,
        avatar,
        deck,
        format,
    }
}

pub fn session(world: &World) -> Session {
    Session::new(options(), Arc::new(world.target.connector()))
}

pub async fn connected(world: &World) -> Session {
    let session = session(world);
    session.connect(Duration::from_secs(2)).await.unwrap();
    session
}
