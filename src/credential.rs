//! # Credentials
//!
//! Payload types carried by `get`, `store`, `registerDid` and
//! `requestPermission` flows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-LD context of identity registration requests.
pub const IDENTITY_CONTEXT: &str = "https://w3id.org/identity/v1";

/// A credential exchanged between requester and holder.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Credential {
    /// A credential about an identified subject.
    Identity(IdentityCredential),

    /// Any other JSON credential, passed through untouched.
    Opaque(Value),
}

impl Credential {
    /// The credential's identifier, if it has one.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Identity(identity) => Some(&identity.id),
            Self::Opaque(value) => value.get("id").and_then(Value::as_str),
        }
    }
}

impl From<IdentityCredential> for Credential {
    fn from(identity: IdentityCredential) -> Self {
        Self::Identity(identity)
    }
}

/// A credential about an identified subject: its identifier (typically a
/// DID) and any number of claims.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdentityCredential {
    /// Subject identifier.
    pub id: String,

    /// Claims about the subject.
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl IdentityCredential {
    /// A credential for `id` with no claims.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }

    /// Add a claim.
    #[must_use]
    pub fn claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }
}

/// Parameters of a `registerDid` flow.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidRegistration {
    /// JSON-LD context.
    #[serde(rename = "@context")]
    pub context: String,

    /// DID of the identity provider.
    pub idp: String,

    /// Where the identity provider reports the registration.
    pub registration_callback: String,
}

/// The holder's answer to a permission request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    /// The permission was granted.
    Granted,
    /// The permission was refused.
    Denied,
}

/// The holder's answers to a `requestPermission` flow, by permission name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PermissionStatus {
    /// Answer per requested permission.
    pub permissions: BTreeMap<String, PermissionState>,
}

impl PermissionStatus {
    /// Whether `name` was granted.
    #[must_use]
    pub fn granted(&self, name: &str) -> bool {
        self.permissions.get(name) == Some(&PermissionState::Granted)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identity_has_flattened_claims() {
        let credential: Credential = serde_json::from_value(json!({"id": "x", "foo": "bar"})).unwrap();
        let Credential::Identity(identity) = &credential else {
            panic!("expected identity credential");
        };
        assert_eq!(identity.claims.get("foo"), Some(&json!("bar")));
        assert_eq!(serde_json::to_value(&credential).unwrap(), json!({"id": "x", "foo": "bar"}));
    }

    #[test]
    fn credential_without_id_is_opaque() {
        let credential: Credential = serde_json::from_value(json!({"foo": "bar"})).unwrap();
        assert!(matches!(credential, Credential::Opaque(_)));
        assert_eq!(credential.id(), None);
    }
}
