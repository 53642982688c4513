//! # Requester API
//!
//! Entry points for a site that wants a credential: retrieving, storing and
//! registering identities. Each call runs one complete flow through the
//! mediator and resolves once the flow has ended and its contexts are closed.
//!
//! Options are validated before any context is opened. If the user closes the
//! mediator (or the holder cancels), `get`, `store` and `register` resolve
//! with `None` rather than failing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::EventListener;
use crate::config::FlowOptions;
use crate::context::Window;
use crate::credential::{Credential, DidRegistration, PermissionStatus, IDENTITY_CONTEXT};
use crate::error::{Error, Result};
use crate::flow::{self, Outcome};
use crate::message::Operation;

/// Options for [`CredentialsContainer::get`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOptions {
    /// Query describing the credential wanted. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,

    /// Flow options.
    #[serde(flatten)]
    pub flow: FlowOptions,
}

/// Options for [`IdentityRegistration::register`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOptions {
    /// DID of the identity provider. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idp: Option<String>,

    /// Where the identity provider reports the registration. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_callback: Option<String>,

    /// Flow options.
    #[serde(flatten)]
    pub flow: FlowOptions,
}

/// Credential operations available to the document running in `window`.
pub struct CredentialsContainer<W> {
    pub(crate) window: W,
    listener: Option<EventListener>,
}

impl<W: Window> CredentialsContainer<W> {
    /// Credential operations for `window`.
    pub const fn new(window: W) -> Self {
        Self { window, listener: None }
    }

    /// Listen for events the mediator escalates during requester flows.
    pub fn on_event(&mut self, listener: EventListener) {
        self.listener = Some(listener);
    }

    /// Ask the user's holder for a credential matching `options.query`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no query is given, or any flow error
    /// other than an abort.
    pub async fn get(&self, options: GetOptions) -> Result<Option<Credential>> {
        let Some(query) = options.query else {
            return Err(Error::Validation("could not get credentials: no query provided".into()));
        };
        let params = json!({"query": query});
        let result = run(&self.window, self.listener.clone(), Operation::Get, params, options.flow).await?;
        credential(result)
    }

    /// Ask the user's holder to store `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty credential, or any flow error
    /// other than an abort.
    pub async fn store(&self, credential: Credential, options: FlowOptions) -> Result<Option<Credential>> {
        if matches!(credential, Credential::Opaque(Value::Null)) {
            return Err(Error::Validation("could not store credential: no credential provided".into()));
        }
        let params = serde_json::to_value(credential)?;
        let result = run(&self.window, self.listener.clone(), Operation::Store, params, options).await?;
        self::credential(result)
    }
}

/// Identity registration operations available to the document running in
/// `window`.
pub struct IdentityRegistration<W> {
    window: W,
    listener: Option<EventListener>,
}

impl<W: Window> IdentityRegistration<W> {
    /// Registration operations for `window`.
    pub const fn new(window: W) -> Self {
        Self { window, listener: None }
    }

    /// Listen for events the mediator escalates during registration flows.
    pub fn on_event(&mut self, listener: EventListener) {
        self.listener = Some(listener);
    }

    /// Register a DID with the identity provider `options.idp`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the identity provider or its callback
    /// is missing, or any flow error other than an abort.
    pub async fn register(&self, options: RegisterOptions) -> Result<Option<Credential>> {
        let Some(idp) = options.idp else {
            return Err(Error::Validation("could not register DID: identity provider's DID not provided".into()));
        };
        let Some(registration_callback) = options.registration_callback else {
            return Err(Error::Validation(
                "could not register DID: identity provider's callback URL not provided".into(),
            ));
        };
        let params = serde_json::to_value(DidRegistration {
            context: IDENTITY_CONTEXT.to_string(),
            idp,
            registration_callback,
        })?;
        let result = run(&self.window, self.listener.clone(), Operation::RegisterDid, params, options.flow).await?;
        credential(result)
    }

    /// Ask the holder to grant `permissions`.
    ///
    /// Unlike the credential operations, closing the mediator is reported as
    /// [`Error::Aborted`]: there is no neutral answer to a permission request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no permissions are requested, or any
    /// flow error.
    pub async fn request_permission(&self, permissions: &[&str], options: FlowOptions) -> Result<PermissionStatus> {
        if permissions.is_empty() {
            return Err(Error::Validation("could not request permission: no permissions provided".into()));
        }
        let params = json!({"permissions": permissions});
        let outcome =
            flow::start(&self.window, Operation::RequestPermission, params, options, self.listener.clone()).await?;
        match outcome {
            Outcome::Resolved(value) => Ok(serde_json::from_value(value)?),
            Outcome::Aborted => Err(Error::Aborted),
        }
    }
}

/// Run a flow, resolving aborts as `None`.
async fn run(
    window: &impl Window, listener: Option<EventListener>, op: Operation, params: Value, options: FlowOptions,
) -> Result<Option<Value>> {
    match flow::start(window, op, params, options, listener).await {
        Ok(outcome) => Ok(outcome.into_value()),
        Err(Error::Aborted) => Ok(None),
        Err(e) => Err(e),
    }
}

fn credential(result: Option<Value>) -> Result<Option<Credential>> {
    match result {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}
