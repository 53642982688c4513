//! # Credibil Mediator
//!
//! A protocol library that lets three mutually untrusting parties exchange a
//! credential request and its result using only cross-origin messaging:
//!
//! - a **requester**, the site that wants (or wants to store) a credential,
//! - a **holder**, the repository or identity provider that fulfils it,
//! - a **mediator**, the neutral, well-known agent that brokers between them.
//!
//! No party trusts another's network channel: every message is addressed to a
//! context by origin and checked on arrival against the expected sender and
//! origin.
//!
//! # Design
//!
//! ** Flow State **
//!
//! Each operation (`get`, `store`, `registerDid`, `requestPermission`) runs as
//! one flow: a request/response round trip plus, optionally, one event round
//! trip. The requester side of a flow is a typestate [`flow::Flow`] that owns
//! the contexts it opens and closes them on every exit path. The passive side
//! is a [`router::Router`] that borrows its opener or parent.
//!
//! Two generations of the choreography are supported side by side, selected
//! by [`config::ProtocolVersion`]: the legacy `0.7.x` relay, which hands
//! requests between hops through session storage and an explicit
//! navigate-away step, and the current direct exchange.
//!
//! ** Provider **
//!
//! Protocol code reaches its environment through the [`context::Window`]
//! trait: the local endpoint, the opener or parent, session storage, and
//! opening or navigating contexts. The [`browser`] module provides an
//! in-memory implementation hosting one app per origin.
//!
//! # Example
//!
//! See the `tests` directory for requester, mediator and repository apps
//! wired together for both protocol generations.

pub mod browser;
pub mod channel;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod flow;
pub mod holder;
pub mod mediator;
pub mod message;
pub mod origin;
pub mod requester;
pub mod router;
pub mod store;

pub use config::{FlowOptions, ProtocolVersion};
pub use credential::{Credential, IdentityCredential};
pub use error::{Error, Result};
pub use holder::PendingOperation;
pub use message::{Message, MessageType, Operation, Phase};
pub use origin::Origin;
pub use requester::{CredentialsContainer, GetOptions, IdentityRegistration, RegisterOptions};
