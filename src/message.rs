//! # Messages
//!
//! The wire unit exchanged between two contexts: `{type, data}`. The `type`
//! is a structured pair of operation and phase (or one of the protocol
//! control literals); the dotted string form only exists on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{protocol_err, Error, Result};
use crate::origin::Origin;

/// A credential operation supported by the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Operation {
    /// Retrieve a credential from a holder.
    #[serde(rename = "get")]
    Get,

    /// Submit a credential to a holder for storage.
    #[serde(rename = "store")]
    Store,

    /// Register a decentralized identifier with an identity provider.
    #[serde(rename = "registerDid")]
    RegisterDid,

    /// Ask the holder to grant the requester permissions.
    #[serde(rename = "requestPermission")]
    RequestPermission,
}

impl Operation {
    /// All operations, in wire order.
    pub const ALL: [Self; 4] = [Self::Get, Self::Store, Self::RegisterDid, Self::RequestPermission];

    /// The wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Store => "store",
            Self::RegisterDid => "registerDid",
            Self::RequestPermission => "requestPermission",
        }
    }

    /// Shorthand for the message type `<op>.<phase>`.
    #[must_use]
    pub const fn phase(self, phase: Phase) -> MessageType {
        MessageType::Operation(self, phase)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| protocol_err!("unknown operation `{s}`"))
    }
}

/// The phase of an operation a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The requester's parameters.
    Params,
    /// The holder's result.
    Result,
    /// The holder cancelled the operation.
    Abort,
    /// The holder failed the operation.
    Error,
}

impl Phase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Params => "params",
            Self::Result => "result",
            Self::Abort => "abort",
            Self::Error => "error",
        }
    }
}

/// The type tag of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `<operation>.<phase>`.
    Operation(Operation, Phase),
    /// A probe asking the counterpart to send one of the listed types.
    Request,
    /// Acknowledges an `event` once its listener has settled.
    Continue,
    /// Legacy: asks the receiver to navigate its context onward.
    Navigate,
    /// Legacy: ends a relay hop. Accepted inbound for compatibility with
    /// older agents; never sent.
    End,
    /// Side-channel event escalated to the counterpart's listener.
    Event,
}

impl MessageType {
    /// The operation this message belongs to, if any.
    #[must_use]
    pub const fn operation(self) -> Option<Operation> {
        match self {
            Self::Operation(op, _) => Some(op),
            _ => None,
        }
    }

    /// The `params` types of every operation. Used by a holder that does not
    /// know which operation is pending.
    #[must_use]
    pub fn all_params() -> Vec<Self> {
        Operation::ALL.into_iter().map(|op| op.phase(Phase::Params)).collect()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(op, phase) => write!(f, "{op}.{}", phase.as_str()),
            Self::Request => f.write_str("request"),
            Self::Continue => f.write_str("continue"),
            Self::Navigate => f.write_str("navigate"),
            Self::End => f.write_str("end"),
            Self::Event => f.write_str("event"),
        }
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tag = match s {
            "request" => Self::Request,
            "continue" => Self::Continue,
            "navigate" => Self::Navigate,
            "end" => Self::End,
            "event" => Self::Event,
            _ => {
                let Some((op, phase)) = s.split_once('.') else {
                    return Err(protocol_err!("unknown message type `{s}`"));
                };
                let phase = match phase {
                    "params" => Phase::Params,
                    "result" => Phase::Result,
                    "abort" => Phase::Abort,
                    "error" => Phase::Error,
                    _ => return Err(protocol_err!("unknown message phase `{phase}`")),
                };
                Self::Operation(op.parse()?, phase)
            }
        };
        Ok(tag)
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A message exchanged between two contexts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    /// The message type.
    #[serde(rename = "type")]
    pub type_: MessageType,

    /// The message payload.
    #[serde(default)]
    pub data: Value,

    /// Origin the payload was first received from, when a mediator relays it
    /// on behalf of another context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub const fn new(type_: MessageType, data: Value) -> Self {
        Self { type_, data, origin: None }
    }

    /// Mark the message as relayed on behalf of `origin`.
    #[must_use]
    pub fn relayed_from(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Decode a message from its wire form.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the value is not a well-formed message.
    pub fn decode(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| protocol_err!("malformed message: {e}"))
    }

    /// Encode the message to its wire form.
    #[must_use]
    pub fn encode(&self) -> Value {
        let mut value = serde_json::json!({"type": self.type_.to_string(), "data": self.data});
        if let Some(origin) = &self.origin {
            value["origin"] = Value::String(origin.to_string());
        }
        value
    }
}

/// The payload of a `request` probe: the types the prober will accept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Probe {
    /// Acceptable response types.
    pub accept: Vec<MessageType>,
}

/// The payload of an `event` message.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Event {
    /// Event name.
    pub name: String,

    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_tags() {
        let tag: MessageType = "registerDid.params".parse().unwrap();
        assert_eq!(tag, Operation::RegisterDid.phase(Phase::Params));
        assert_eq!(Operation::Get.phase(Phase::Result).to_string(), "get.result");
        assert_eq!("continue".parse::<MessageType>().unwrap(), MessageType::Continue);
    }

    #[test]
    fn unknown_tags_are_protocol_errors() {
        for tag in ["get", "get.done", "fetch.params", ""] {
            let err = tag.parse::<MessageType>().unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "{tag}: {err}");
        }
    }

    #[test]
    fn decode_message() {
        let msg = Message::decode(json!({"type": "store.result", "data": {"id": "x"}})).unwrap();
        assert_eq!(msg.type_, Operation::Store.phase(Phase::Result));
        assert_eq!(msg.data, json!({"id": "x"}));

        let msg = Message::decode(json!({"type": "continue"})).unwrap();
        assert_eq!(msg.data, Value::Null);

        assert_eq!(msg.origin, None);

        assert!(Message::decode(json!({"data": 1})).is_err());
        assert!(Message::decode(json!("get.result")).is_err());
    }

    #[test]
    fn relayed_origin_on_the_wire() {
        let rp: Origin = "https://rp.example".parse().unwrap();
        let msg = Message::new(Operation::Get.phase(Phase::Params), json!({"query": {}})).relayed_from(rp.clone());
        let wire = msg.encode();
        assert_eq!(wire["origin"], json!("https://rp.example"));
        assert_eq!(Message::decode(wire).unwrap().origin, Some(rp));

        let plain = Message::new(MessageType::Continue, Value::Null).encode();
        assert!(plain.get("origin").is_none());
    }

    #[test]
    fn end_is_parsed() {
        assert_eq!("end".parse::<MessageType>().unwrap(), MessageType::End);
    }

    #[test]
    fn probe_lists_types() {
        let probe = Probe { accept: MessageType::all_params() };
        let value = serde_json::to_value(&probe).unwrap();
        assert_eq!(
            value,
            json!({"accept": [
                "get.params", "store.params", "registerDid.params", "requestPermission.params"
            ]})
        );
    }
}
