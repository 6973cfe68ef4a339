// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remote sessions.
//!
//! Remote browser processes report progress over HTTP as `(sessionId,
//! sequence, payload)` tuples. The [`Sequencer`] restores strict per-session
//! ordering, and a [`RemoteSuite`] consumes the ordered stream in place of
//! running test bodies locally.

mod ingress;
mod sequencer;
mod suite;

pub use ingress::*;
pub use sequencer::*;
pub use suite::*;

use debug_ignore::DebugIgnore;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use smol_str::SmolStr;
use std::{any::Any, sync::Arc};

/// A handle to a remote browser session.
///
/// Exposes the session id, plus an opaque environment object (e.g. a tunnel)
/// attached to a root suite for teardown bookkeeping only.
#[derive(Clone, Debug)]
pub struct RemoteHandle {
    session_id: SmolStr,
    environment: Option<DebugIgnore<Arc<dyn Any + Send + Sync>>>,
}

impl RemoteHandle {
    /// Creates a handle for the given session.
    pub fn new(session_id: impl Into<SmolStr>) -> Self {
        Self {
            session_id: session_id.into(),
            environment: None,
        }
    }

    /// Attaches an opaque environment object.
    pub fn with_environment(mut self, environment: Arc<dyn Any + Send + Sync>) -> Self {
        self.environment = Some(DebugIgnore(environment));
        self
    }

    /// The session id.
    pub fn session_id(&self) -> &SmolStr {
        &self.session_id
    }

    /// The attached environment object, if any.
    pub fn environment(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.environment.as_ref().map(|environment| &environment.0)
    }
}

/// One message from a remote session.
///
/// On the wire this is `{ "sessionId": ..., "sequence": ..., "payload":
/// [eventName, ...args] }`. The same shape is handed to session listeners
/// once its turn in the sequence arrives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    /// The session the message belongs to.
    pub session_id: SmolStr,

    /// The monotonic per-session sequence number, starting at 0.
    pub sequence: u64,

    /// The event payload.
    pub payload: RemotePayload,
}

/// A remote event payload: an event name plus raw arguments.
///
/// Serialized as a JSON array whose first element is the event name.
#[derive(Clone, Debug, PartialEq)]
pub struct RemotePayload {
    /// The event name (e.g. `suiteStart`).
    pub name: SmolStr,

    /// The event arguments, left uninterpreted.
    pub args: Vec<serde_json::Value>,
}

impl RemotePayload {
    /// Creates a payload from a name and arguments.
    pub fn new(name: impl Into<SmolStr>, args: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl Serialize for RemotePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.args.len() + 1))?;
        seq.serialize_element(self.name.as_str())?;
        for arg in &self.args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RemotePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut values = Vec::<serde_json::Value>::deserialize(deserializer)?;
        if values.is_empty() {
            return Err(D::Error::custom("payload must start with an event name"));
        }
        let name = match values.remove(0) {
            serde_json::Value::String(name) => SmolStr::from(name),
            other => {
                return Err(D::Error::custom(format!(
                    "event name must be a string, got {other}"
                )));
            }
        };
        Ok(Self { name, args: values })
    }
}
