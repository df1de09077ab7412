//! Capability lookup for remote types.
//!
//! A type's member table is fetched from the target once per session and
//! cached by type name. Proxies consult it to reject bad calls locally:
//! reading a method as a property, invoking with the wrong arity or argument
//! kinds, writing a read-only property, subscribing to something that is not
//! an event.
//!
//! Members the table does not mention are let through untouched; the target
//! has the final word on those.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use remora_protocol::{MemberInfo, MemberKind, TypeInfo, Value, ValueKind};

use crate::error::{Error, Result};

/// The members one remote type is known to expose.
#[derive(Debug, Clone)]
pub struct Capabilities {
    type_name: String,
    members: HashMap<String, MemberInfo>,
    described: bool,
}

impl Capabilities {
    pub fn from_type_info(info: TypeInfo) -> Self {
        Self {
            type_name: info.name,
            members: info
                .members
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
            described: true,
        }
    }

    /// For types the target could not describe. Every check passes.
    pub fn unknown(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            members: HashMap::new(),
            described: false,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Whether the target supplied a member table for this type.
    pub fn is_described(&self) -> bool {
        self.described
    }

    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values()
    }

    /// Declared type of a property or return type of a method.
    pub fn returns(&self, name: &str) -> Option<&ValueKind> {
        self.member(name).map(|m| &m.returns)
    }

    pub fn check_property(&self, name: &str) -> Result<()> {
        self.expect_kind(name, MemberKind::Property)
    }

    pub fn check_writable(&self, name: &str, value: &Value) -> Result<()> {
        self.expect_kind(name, MemberKind::Property)?;
        let Some(member) = self.member(name) else {
            return Ok(());
        };
        if !member.writable {
            return Err(Error::Argument(format!(
                "{}.{name} is read-only",
                self.type_name
            )));
        }
        if !member.returns.accepts(value) {
            return Err(Error::Argument(format!(
                "{}.{name} expects {}, got {}",
                self.type_name,
                member.returns,
                value.kind_name()
            )));
        }
        Ok(())
    }

    pub fn check_invocation(&self, name: &str, args: &[Value]) -> Result<()> {
        self.expect_kind(name, MemberKind::Method)?;
        let Some(member) = self.member(name) else {
            return Ok(());
        };
        if member.params.len() != args.len() {
            return Err(Error::Argument(format!(
                "{}.{name} takes {} argument(s), got {}",
                self.type_name,
                member.params.len(),
                args.len()
            )));
        }
        for (index, (kind, arg)) in member.params.iter().zip(args).enumerate() {
            if !kind.accepts(arg) {
                return Err(Error::Argument(format!(
                    "{}.{name} argument {index} expects {kind}, got {}",
                    self.type_name,
                    arg.kind_name()
                )));
            }
        }
        Ok(())
    }

    pub fn check_event(&self, name: &str) -> Result<()> {
        self.expect_kind(name, MemberKind::Event)
    }

    fn expect_kind(&self, name: &str, expected: MemberKind) -> Result<()> {
        match self.member(name) {
            Some(member) if member.kind != expected => Err(Error::Argument(format!(
                "{}.{name} is {}, not {}",
                self.type_name,
                describe(member.kind),
                describe(expected)
            ))),
            _ => Ok(()),
        }
    }
}

fn describe(kind: MemberKind) -> &'static str {
    match kind {
        MemberKind::Property => "a property",
        MemberKind::Method => "a method",
        MemberKind::Event => "an event",
    }
}

/// Per-session cache of [`Capabilities`] keyed by type name.
#[derive(Debug, Default)]
pub struct CapabilityResolver {
    cache: RwLock<HashMap<String, Arc<Capabilities>>>,
}

impl CapabilityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, type_name: &str) -> Option<Arc<Capabilities>> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(type_name)
            .cloned()
    }

    /// Cache `capabilities`, keeping an entry that raced in first.
    pub fn insert(&self, capabilities: Capabilities) -> Arc<Capabilities> {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            cache
                .entry(capabilities.type_name.clone())
                .or_insert_with(|| Arc::new(capabilities)),
        )
    }

    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
