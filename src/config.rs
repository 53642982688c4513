//! # Configuration
//!
//! Options accepted by every entry point. Options deserialize from the same
//! camel-cased JSON a requester page would pass, e.g.
//! `{"agentUrl": "/agent", "version": "0.7.x"}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

/// The well-known mediator endpoint used when no `agentUrl` is given.
pub const DEFAULT_AGENT_URL: &str = "https://authorization.io/agent";

/// The generation of the flow choreography.
///
/// Counterparts upgrade independently, so both generations are supported side
/// by side and selected by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ProtocolVersion {
    /// Multi-hop relay through the mediator, with an explicit navigate-away
    /// step and session-stored hand-offs.
    #[serde(rename = "0.7.x")]
    Legacy,

    /// Direct opener/parent addressing without navigation.
    #[default]
    #[serde(rename = "1.0")]
    Current,
}

/// Options accepted by every flow entry point.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOptions {
    /// URL of the mediator's agent endpoint. Relative URLs are resolved
    /// against the calling page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,

    /// Protocol generation to speak.
    #[serde(default)]
    pub version: ProtocolVersion,

    /// Upper bound, in milliseconds, on each wait for the counterpart. Waits
    /// are unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl FlowOptions {
    /// Options for the given protocol generation.
    #[must_use]
    pub const fn for_version(version: ProtocolVersion) -> Self {
        Self {
            agent_url: None,
            version,
            timeout_ms: None,
        }
    }

    /// Use the agent at `url`.
    #[must_use]
    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = Some(url.into());
        self
    }

    /// Bound each wait by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The configured timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Resolve the agent URL against the calling page.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn agent_url(&self, base: &Url) -> Result<Url> {
        Ok(base.join(self.agent_url.as_deref().unwrap_or(DEFAULT_AGENT_URL))?)
    }
}
