//! # Flow Controller
//!
//! The active side of the handshake.
//!
//! A requester drives a [`Flow`] through its states: the flow opens a context
//! on the mediator, serves the operation's parameters, then waits for the
//! result. The state is encoded in the type so the steps can only be taken in
//! order:
//!
//! ```text
//! Flow<Init> --open--> Flow<Open> --serve_params--> Flow<ParamsServed> --result--> Outcome
//! ```
//!
//! The context opened by a flow is owned by it and closed on every exit path:
//! success, error, abort or timeout.
//!
//! A holder that did not initiate the flow uses [`resume`] to fetch the pending
//! request from the context that created it, and [`end`] to return the result.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::channel::{AbortSignal, Channel, EventListener};
use crate::config::{FlowOptions, ProtocolVersion};
use crate::context::{ContextHandle, ContextMode, OwnedContext, Window};
use crate::error::{protocol_err, Error, Result};
use crate::message::{MessageType, Operation, Phase};
use crate::origin::Origin;
use crate::router::Router;
use crate::store::Route;

/// The flow has not opened a context yet.
#[derive(Debug)]
pub struct Init;

/// A context has been opened on the mediator.
#[derive(Debug)]
pub struct Open {
    context: OwnedContext,
    channel: Channel,
}

/// The parameters have been served; the flow is waiting for the result.
#[derive(Debug)]
pub struct ParamsServed {
    context: OwnedContext,
    channel: Channel,
}

/// How a flow ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The holder returned a result.
    Resolved(Value),
    /// The flow was cancelled by the user or the holder.
    Aborted,
}

impl Outcome {
    /// The result, or `None` if the flow was aborted.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Aborted => None,
        }
    }
}

/// A requester-initiated flow for one operation.
#[derive(Debug)]
pub struct Flow<S> {
    op: Operation,
    options: FlowOptions,
    state: S,
}

impl Flow<Init> {
    /// Prepare a flow for `op`.
    #[must_use]
    pub const fn new(op: Operation, options: FlowOptions) -> Self {
        Self {
            op,
            options,
            state: Init,
        }
    }

    /// Open a top-level context on the mediator's agent endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent URL is invalid or the context cannot be
    /// opened.
    pub async fn open(self, window: &impl Window) -> Result<Flow<Open>> {
        let mut url = self.options.agent_url(window.url())?;
        if self.options.version == ProtocolVersion::Legacy {
            url = relay_url(&url, self.op, Route::Params);
        }
        tracing::info!(op = %self.op, agent = %url, version = ?self.options.version, "starting flow");

        let handle = window.open(&url, ContextMode::TopLevel).await?;
        let context = OwnedContext::new(handle);
        context.show()?;
        let channel = Channel::bind(window.endpoint().clone(), (*context).clone());

        Ok(Flow {
            op: self.op,
            options: self.options,
            state: Open { context, channel },
        })
    }
}

impl Flow<Open> {
    /// The context opened on the mediator.
    #[must_use]
    pub fn context(&self) -> &ContextHandle {
        &self.state.context
    }

    /// Register the listener for events the mediator escalates while the flow
    /// is running.
    pub fn on_event(&mut self, listener: EventListener) {
        self.state.channel.on_event(listener);
    }

    /// Serve `<op>.params` to the mediator once it asks for them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the context is closed first, or a protocol
    /// or timeout error. The context is closed in every error case.
    pub async fn serve_params(self, params: Value) -> Result<Flow<ParamsServed>> {
        let Open { context, mut channel } = self.state;
        let type_ = self.op.phase(Phase::Params);

        let signal = channel.abort_signal();
        let waiting_for = format!("request for {type_}");
        guarded(&context, signal, self.options.timeout(), waiting_for, channel.serve(type_, params)).await?;

        Ok(Flow {
            op: self.op,
            options: self.options,
            state: ParamsServed { context, channel },
        })
    }
}

impl Flow<ParamsServed> {
    /// Wait for the holder's answer, then close the context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the holder failed the operation, or a
    /// protocol or timeout error. Closing the context, or the holder
    /// cancelling, is not an error: it yields [`Outcome::Aborted`].
    pub async fn result(self) -> Result<Outcome> {
        let ParamsServed { context, mut channel } = self.state;
        let accept = [self.op.phase(Phase::Result), self.op.phase(Phase::Abort), self.op.phase(Phase::Error)];

        let signal = channel.abort_signal();
        let waiting_for = accept[0].to_string();
        let received = guarded(&context, signal, self.options.timeout(), waiting_for, channel.receive(&accept)).await;
        context.close();

        let message = match received {
            Ok(message) => message,
            Err(Error::Aborted) => {
                tracing::warn!(op = %self.op, "context closed before the flow completed");
                return Ok(Outcome::Aborted);
            }
            Err(e) => return Err(e),
        };

        match message.type_ {
            MessageType::Operation(_, Phase::Result) => {
                tracing::info!(op = %self.op, "flow resolved");
                Ok(Outcome::Resolved(message.data))
            }
            MessageType::Operation(_, Phase::Abort) => {
                tracing::warn!(op = %self.op, "holder cancelled the flow");
                Ok(Outcome::Aborted)
            }
            _ => Err(Error::Remote(error_message(&message.data))),
        }
    }
}

/// Run a complete requester flow for `op`: open, serve `params`, and wait for
/// the result.
///
/// # Errors
///
/// As [`Flow::open`], [`Flow::serve_params`] and [`Flow::result`], except that
/// a context closed while serving the parameters also yields
/// [`Outcome::Aborted`].
pub async fn start(
    window: &impl Window, op: Operation, params: Value, options: FlowOptions, listener: Option<EventListener>,
) -> Result<Outcome> {
    let mut flow = Flow::new(op, options).open(window).await?;
    if let Some(listener) = listener {
        flow.on_event(listener);
    }
    match flow.serve_params(params).await {
        Ok(flow) => flow.result().await,
        Err(Error::Aborted) => Ok(Outcome::Aborted),
        Err(e) => Err(e),
    }
}

/// A request retrieved by a holder that did not initiate the flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    /// The pending operation.
    pub op: Operation,

    /// The operation's parameters.
    pub params: Value,

    /// Origin of the context the parameters were received from.
    pub origin: Origin,

    /// Origin of the requester, as reported by the mediator relaying the
    /// parameters.
    pub requester: Option<Origin>,
}

/// Fetch the request pending for this context.
///
/// The holder does not know in advance which operation is pending, so any of
/// the `*.params` types is accepted.
///
/// Current protocol: the parameters are requested from the context's parent
/// (or opener). Legacy protocol: an agent frame is embedded at the agent URL
/// and pushes the parameters it stored for this tab.
///
/// # Errors
///
/// Returns an error if this context has no opener or parent, the agent
/// cannot be opened, or the counterpart misbehaves.
pub async fn resume(window: &impl Window, options: &FlowOptions) -> Result<PendingRequest> {
    let accept = MessageType::all_params();
    let waiting_for = "pending request".to_string();

    let (message, origin) = match options.version {
        ProtocolVersion::Current => {
            let counterpart = window.counterpart().ok_or(Error::ContextClosed)?;
            let origin = counterpart.origin().clone();
            let mut router = Router::new(window.endpoint().clone(), counterpart);
            (bounded(options.timeout(), waiting_for, router.request(&accept)).await?, origin)
        }
        ProtocolVersion::Legacy => {
            let url = legacy_agent_url(window, options, Route::Params)?;
            let context = OwnedContext::new(window.open(&url, ContextMode::Embedded).await?);
            let origin = context.origin().clone();
            let mut channel = Channel::bind(window.endpoint().clone(), (*context).clone());
            let signal = channel.abort_signal();
            (guarded(&context, signal, options.timeout(), waiting_for, channel.receive(&accept)).await?, origin)
        }
    };

    let Some(op) = message.type_.operation() else {
        return Err(protocol_err!("`{}` is not an operation", message.type_));
    };
    tracing::info!(%op, requester = ?message.origin, "resumed pending operation");
    Ok(PendingRequest {
        op,
        params: message.data,
        origin,
        requester: message.origin,
    })
}

/// Return the holder's answer for `op` to the context that created this one.
///
/// `phase` is [`Phase::Result`] for a result, [`Phase::Abort`] if the holder
/// cancelled, or [`Phase::Error`] if it failed.
///
/// Current protocol: the answer is sent to the parent (or opener) and the
/// call returns immediately. Legacy protocol: an agent frame is embedded to
/// collect the answer; once it asks us to `navigate`, this context navigates
/// to the agent's result route, which delivers the answer to the requester.
///
/// # Errors
///
/// Returns an error if there is no counterpart or the agent misbehaves.
pub async fn end(window: &impl Window, op: Operation, phase: Phase, data: Value, options: &FlowOptions) -> Result<()> {
    let type_ = op.phase(phase);
    match options.version {
        ProtocolVersion::Current => {
            let counterpart = window.counterpart().ok_or(Error::ContextClosed)?;
            Router::new(window.endpoint().clone(), counterpart).send(type_, data);
            Ok(())
        }
        ProtocolVersion::Legacy => {
            let url = legacy_agent_url(window, options, Route::Result)?;
            let context = OwnedContext::new(window.open(&url, ContextMode::Embedded).await?);
            let mut channel = Channel::bind(window.endpoint().clone(), (*context).clone());

            let signal = channel.abort_signal();
            let waiting_for = format!("request for {type_}");
            guarded(&context, signal, options.timeout(), waiting_for, channel.serve(type_, data)).await?;

            let signal = channel.abort_signal();
            let waiting_for = "navigate".to_string();
            guarded(&context, signal, options.timeout(), waiting_for, channel.receive(&[MessageType::Navigate]))
                .await?;
            context.close();

            // hand the window back to the agent, which delivers the answer
            let mut next = url.clone();
            next.query_pairs_mut().clear().extend_pairs(url.query_pairs().filter(|(k, _)| k != "cmd"));
            tracing::info!(%op, to = %next, "navigating to agent");
            window.navigate(&next)
        }
    }
}

/// The legacy agent URL for a relay hop. An agent URL that already names the
/// operation is used as given; otherwise the operation is taken from this
/// page's `op` query parameter.
fn legacy_agent_url(window: &impl Window, options: &FlowOptions, route: Route) -> Result<Url> {
    let url = options.agent_url(window.url())?;
    if url.query_pairs().any(|(k, _)| k == "type") {
        return Ok(url);
    }
    let op = window
        .url()
        .query_pairs()
        .find(|(k, _)| k == "op")
        .ok_or_else(|| Error::Validation("legacy flows need the pending operation type".into()))?
        .1
        .parse::<Operation>()?;
    Ok(relay_url(&url, op, route))
}

/// `url` with the legacy relay query `type=<op>&route=<route>`.
fn relay_url(url: &Url, op: Operation, route: Route) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("type", op.as_str()).append_pair("route", &route.to_string());
    url
}

/// Await `wait`, bounded by `timeout`, aborting it if `context` closes first.
async fn guarded<T>(
    context: &ContextHandle, signal: AbortSignal, timeout: Option<Duration>, waiting_for: String,
    wait: impl Future<Output = Result<T>>,
) -> Result<T> {
    let wait = bounded(timeout, waiting_for, wait);
    let closed = context.closed();
    tokio::pin!(wait, closed);

    let mut armed = false;
    loop {
        tokio::select! {
            result = &mut wait => return result,
            () = &mut closed, if !armed => {
                armed = true;
                signal.abort();
            }
        }
    }
}

async fn bounded<T>(
    timeout: Option<Duration>, waiting_for: String, wait: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        None => wait.await,
        Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| {
            tracing::warn!(%waiting_for, "timed out");
            Error::Timeout(waiting_for)
        })?,
    }
}

fn error_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .or_else(|| data.as_str())
        .map_or_else(|| data.to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn relay_urls() {
        let agent = Url::parse("https://mediator.example/agent").unwrap();
        let url = relay_url(&agent, Operation::Store, Route::Params);
        assert_eq!(url.as_str(), "https://mediator.example/agent?type=store&route=params");
        let url = relay_url(&agent, Operation::RegisterDid, Route::Result);
        assert_eq!(url.as_str(), "https://mediator.example/agent?type=registerDid&route=result");
    }

    #[test]
    fn remote_error_messages() {
        assert_eq!(error_message(&json!({"message": "no such credential"})), "no such credential");
        assert_eq!(error_message(&json!("denied")), "denied");
        assert_eq!(error_message(&json!(42)), "42");
    }

    #[test]
    fn outcome_value() {
        assert_eq!(Outcome::Resolved(json!(1)).into_value(), Some(json!(1)));
        assert_eq!(Outcome::Aborted.into_value(), None);
    }
}
