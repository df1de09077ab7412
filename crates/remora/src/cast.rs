//! Converting channel values into local types.
//!
//! Primitives are copied out of the value. Object references become new live
//! proxies on the same session, so reading a property that holds another
//! remote object yields that object, not a snapshot of it.

use remora_protocol::Value;

use crate::error::{Error, Result};
use crate::handle::RemoteHandle;
use crate::proxy::ObjectProxy;
use crate::session::Session;

/// A type that can be produced from a channel [`Value`].
pub trait Cast: Sized {
    fn cast(session: &Session, value: Value) -> Result<Self>;
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::Argument(format!("expected {expected}, got {}", value.kind_name()))
}

impl Cast for Value {
    fn cast(_: &Session, value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl Cast for () {
    fn cast(_: &Session, _: Value) -> Result<Self> {
        Ok(())
    }
}

impl Cast for bool {
    fn cast(_: &Session, value: Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", &value))
    }
}

impl Cast for i64 {
    fn cast(_: &Session, value: Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch("int", &value))
    }
}

impl Cast for i32 {
    fn cast(session: &Session, value: Value) -> Result<Self> {
        let wide = i64::cast(session, value)?;
        i32::try_from(wide).map_err(|_| Error::Argument(format!("{wide} does not fit in i32")))
    }
}

impl Cast for u32 {
    fn cast(session: &Session, value: Value) -> Result<Self> {
        let wide = i64::cast(session, value)?;
        u32::try_from(wide).map_err(|_| Error::Argument(format!("{wide} does not fit in u32")))
    }
}

impl Cast for f64 {
    fn cast(_: &Session, value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("float", &value))
    }
}

impl Cast for String {
    fn cast(_: &Session, value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl Cast for RemoteHandle {
    fn cast(session: &Session, value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(session.adopt(object)),
            other => Err(mismatch("object", &other)),
        }
    }
}

impl Cast for ObjectProxy {
    fn cast(session: &Session, value: Value) -> Result<Self> {
        let handle = RemoteHandle::cast(session, value)?;
        Ok(ObjectProxy::from_handle(session.clone(), handle))
    }
}

/// Null becomes `None`.
impl<T: Cast> Cast for Option<T> {
    fn cast(session: &Session, value: Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::cast(session, value).map(Some)
        }
    }
}

impl<T: Cast> Cast for Vec<T> {
    fn cast(session: &Session, value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| T::cast(session, item))
                .collect(),
            other => Err(mismatch("list", &other)),
        }
    }
}

/// Declare a typed wrapper over an [`ObjectProxy`].
///
/// The wrapper can be produced by [`ObjectProxy::get`] and friends, and
/// exposes the proxy through `proxy()` for typed accessors built on it:
///
/// ```
/// use remora::{remote_contract, Result};
///
/// remote_contract! {
///     /// A deck grouping in the target.
///     pub struct CardGrouping;
/// }
///
/// remote_contract! {
///     pub struct DeckFormat;
/// }
///
/// impl CardGrouping {
///     pub async fn name(&self) -> Result<String> {
///         self.proxy().get("Name").await
///     }
///
///     pub async fn format(&self) -> Result<Option<DeckFormat>> {
///         self.proxy().get("Format").await
///     }
/// }
/// ```
#[macro_export]
macro_rules! remote_contract {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            proxy: $crate::ObjectProxy,
        }

        impl $name {
            pub fn proxy(&self) -> &$crate::ObjectProxy {
                &self.proxy
            }
        }

        impl ::core::convert::From<$crate::ObjectProxy> for $name {
            fn from(proxy: $crate::ObjectProxy) -> Self {
                Self { proxy }
            }
        }

        impl $crate::Cast for $name {
            fn cast(session: &$crate::Session, value: $crate::Value) -> $crate::Result<Self> {
                <$crate::ObjectProxy as $crate::Cast>::cast(session, value).map(Self::from)
            }
        }
    };
}
