//! # Mediator Agent
//!
//! The neutral agent endpoint that brokers a flow between a requester and the
//! user's holder. The agent speaks both protocol generations; the generation is
//! recognised from the URL it was loaded at.
//!
//! **Current**: the requester opens the agent as a top-level context. The
//! agent requests the parameters, parks them in session storage, announces the
//! repository to the requester, embeds the repository and serves it the
//! parameters, then relays the repository's answer back.
//!
//! **Legacy (`0.7.x`)**: the agent is loaded at
//! `?type=<op>&route=<params|result>` once per relay hop and keeps no state in
//! memory. Each hop either finds a parked record and pushes it on, or requests
//! the record from its counterpart and parks it:
//!
//! 1. requester's popup, `route=params`: request the parameters, park them,
//!    navigate the popup to the repository.
//! 2. frame in the repository, `route=params`: push the parked parameters.
//! 3. frame in the repository, `route=result`: request the answer, park it,
//!    ask the repository to navigate.
//! 4. requester's popup, `route=result`: push the parked answer to the
//!    requester.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::browser::{App, Page};
use crate::channel::Channel;
use crate::context::{ContextHandle, ContextMode, OwnedContext, Window};
use crate::error::{protocol_err, Error, Result};
use crate::message::{Message, MessageType, Operation, Phase};
use crate::router::Router;
use crate::store::{Route, SessionStore};

/// Name of the event announcing the repository to the requester.
pub const REPOSITORY_EVENT: &str = "repository";

const fn default_true() -> bool {
    true
}

/// Mediator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediatorConfig {
    /// Page of the user's chosen repository.
    pub repository_url: Url,

    /// Announce the repository to the requester (and wait for its listener)
    /// before embedding it.
    #[serde(default = "default_true")]
    pub announce_repository: bool,
}

/// The mediator's agent endpoint.
#[derive(Clone, Debug)]
pub struct Mediator {
    config: MediatorConfig,
}

impl Mediator {
    /// An agent brokering flows to the configured repository.
    #[must_use]
    pub const fn new(config: MediatorConfig) -> Self {
        Self { config }
    }

    /// Run the agent in `window`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent has no counterpart, a counterpart
    /// misbehaves, or a parked record does not belong to the requester.
    pub async fn handle(&self, window: &impl Window) -> Result<()> {
        let query = |name: &str| window.url().query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned());
        match (query("type"), query("route")) {
            (Some(op), Some(route)) => self.relay(window, op.parse()?, &route).await,
            (None, None) => self.broker(window).await,
            _ => Err(Error::Validation("agent URL needs both `type` and `route`".into())),
        }
    }

    /// Current protocol: broker the whole flow from one context.
    async fn broker(&self, window: &impl Window) -> Result<()> {
        let requester = window.opener().ok_or(Error::ContextClosed)?;
        let mut router = Router::new(window.endpoint().clone(), requester.clone());

        let params = router.request(&MessageType::all_params()).await?;
        let Some(op) = params.type_.operation() else {
            return Err(protocol_err!("`{}` is not an operation", params.type_));
        };
        tracing::info!(%op, requester = %requester.origin(), "brokering flow");

        let store = window.session_store();
        store.put(op, Route::Params, requester.origin().clone(), params.data)?;

        if self.config.announce_repository {
            let data = json!({"url": self.config.repository_url});
            router.emit(REPOSITORY_EVENT, data).await?;
        }

        match self.consult(window, &store, op).await {
            Ok(answer) => {
                router.send(answer.type_, answer.data);
                Ok(())
            }
            Err(Error::Aborted) => {
                tracing::warn!(%op, "repository closed before answering");
                router.send(op.phase(Phase::Abort), Value::Null);
                Ok(())
            }
            Err(e) => {
                router.send(op.phase(Phase::Error), json!({"message": e.to_string()}));
                Err(e)
            }
        }
    }

    /// Embed the repository, serve it the parked parameters, and return its
    /// answer. The repository frame is closed on return.
    async fn consult(&self, window: &impl Window, store: &SessionStore, op: Operation) -> Result<Message> {
        let handle = window.open(&self.config.repository_url, ContextMode::Embedded).await?;
        let repository = OwnedContext::new(handle);
        repository.show()?;
        let mut channel = Channel::bind(window.endpoint().clone(), (*repository).clone());

        let Some(record) = store.take(op, Route::Params)? else {
            return Err(protocol_err!("no pending `{op}` parameters"));
        };
        let params = Message::new(op.phase(Phase::Params), record.data).relayed_from(record.origin);
        until_closed(&repository, channel.serve_message(params)).await?;

        let accept = [op.phase(Phase::Result), op.phase(Phase::Abort), op.phase(Phase::Error)];
        until_closed(&repository, channel.receive(&accept)).await
    }

    /// Legacy protocol: one relay hop.
    ///
    /// A hop that fails while facing the requester reports `<op>.error` to it
    /// before returning, so the requester's flow ends rather than waiting.
    async fn relay(&self, window: &impl Window, op: Operation, route: &str) -> Result<()> {
        let counterpart = window.counterpart().ok_or(Error::ContextClosed)?;
        let mut router = Router::new(window.endpoint().clone(), counterpart.clone());
        let store = window.session_store();

        match route {
            "params" => {
                if let Some(record) = store.take(op, Route::Params)? {
                    tracing::info!(%op, "agent sending params to repository");
                    store.put(op, Route::Requester, record.origin.clone(), Value::Null)?;
                    let params = Message::new(op.phase(Phase::Params), record.data).relayed_from(record.origin);
                    router.send_message(&params);
                    return Ok(());
                }

                tracing::info!(%op, "agent receiving params from requester");
                let received = self.park_params(window, &mut router, &store, op).await;
                report(&router, op, received)
            }
            "result" => {
                if store.contains(op, Route::Result) {
                    tracing::info!(%op, "agent sending result to requester");
                    let answer = deliverable(&store, op, &counterpart);
                    return report(&router, op, answer.map(|answer| router.send_message(&answer)));
                }

                tracing::info!(%op, "agent receiving result from repository");
                let accept = [op.phase(Phase::Result), op.phase(Phase::Abort), op.phase(Phase::Error)];
                let answer = router.request(&accept).await?;
                store.put(op, Route::Result, counterpart.origin().clone(), answer.encode())?;
                router.navigate();
                Ok(())
            }
            _ => Err(Error::Validation(format!("unknown agent route `{route}`"))),
        }
    }

    /// First hop: take the requester's parameters, park them, and move the
    /// popup on to the repository.
    async fn park_params(
        &self, window: &impl Window, router: &mut Router, store: &SessionStore, op: Operation,
    ) -> Result<()> {
        let params = router.request(&[op.phase(Phase::Params)]).await?;
        store.put(op, Route::Params, router.counterpart().origin().clone(), params.data)?;
        let mut repository = self.config.repository_url.clone();
        repository.query_pairs_mut().append_pair("op", op.as_str());
        window.navigate(&repository)
    }
}

/// Final hop: the parked answer, once the counterpart is confirmed as the
/// requester that started the flow.
fn deliverable(store: &SessionStore, op: Operation, counterpart: &ContextHandle) -> Result<Message> {
    let record = store.take(op, Route::Result)?;
    check_requester(store, op, counterpart)?;
    let Some(record) = record else {
        return Err(protocol_err!("no pending `{op}` result"));
    };
    Message::decode(record.data)
}

/// Report a failed requester-facing hop to the requester as `<op>.error`.
fn report(router: &Router, op: Operation, result: Result<()>) -> Result<()> {
    if let Err(e) = &result {
        tracing::warn!(%op, "relay failed: {e}");
        router.send(op.phase(Phase::Error), json!({"message": e.to_string()}));
    }
    result
}

/// The legacy result hop must answer the requester that started the flow.
fn check_requester(store: &SessionStore, op: Operation, counterpart: &ContextHandle) -> Result<()> {
    let Some(requester) = store.take(op, Route::Requester)? else {
        return Err(protocol_err!("no requester recorded for `{op}`"));
    };
    if &requester.origin != counterpart.origin() {
        tracing::warn!(expected = %counterpart.origin(), found = %requester.origin, "requester origin mismatch");
        return Err(Error::OriginMismatch {
            expected: counterpart.origin().clone(),
            found: requester.origin,
        });
    }
    Ok(())
}

/// Await `wait`, failing with [`Error::Aborted`] if `context` closes first.
async fn until_closed<T>(context: &ContextHandle, wait: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = wait => result,
        () = context.closed() => Err(Error::Aborted),
    }
}

impl App for Mediator {
    fn run(&self, page: Page) -> BoxFuture<'static, anyhow::Result<()>> {
        let mediator = self.clone();
        async move { anyhow::Ok(mediator.handle(&page).await?) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::ContextState;
    use crate::origin::Origin;

    fn handle(origin: &str) -> ContextHandle {
        let endpoint = ContextState::top_level(origin.parse().unwrap()).endpoint();
        ContextHandle::new(Arc::clone(endpoint.state()), endpoint.origin().clone(), ContextMode::Existing)
    }

    #[test]
    fn requester_must_match_recorded_origin() {
        let store = SessionStore::default();
        let rp: Origin = "https://rp.example".parse().unwrap();
        store.put(Operation::Store, Route::Requester, rp, Value::Null).unwrap();

        let err = check_requester(&store, Operation::Store, &handle("https://evil.example")).unwrap_err();
        let Error::OriginMismatch { expected, found } = err else {
            panic!("expected origin mismatch, got {err}");
        };
        assert_eq!(expected.as_str(), "https://evil.example");
        assert_eq!(found.as_str(), "https://rp.example");

        // the record was consumed by the failed check
        assert!(check_requester(&store, Operation::Store, &handle("https://rp.example")).is_err());
    }

    #[test]
    fn requester_record_is_consumed() {
        let store = SessionStore::default();
        store.put(Operation::Get, Route::Requester, "https://rp.example".parse().unwrap(), Value::Null).unwrap();
        check_requester(&store, Operation::Get, &handle("https://rp.example")).unwrap();
        assert!(!store.contains(Operation::Get, Route::Requester));
    }

    #[test]
    fn config_from_json() {
        let config: MediatorConfig =
            serde_json::from_value(json!({"repositoryUrl": "https://repo.example/wallet"})).unwrap();
        assert!(config.announce_repository);
        assert_eq!(config.repository_url.as_str(), "https://repo.example/wallet");
    }
}
