//! # Origin-Scoped Channel
//!
//! A point-to-point channel between the local document and one counterpart
//! context. Outbound messages are only delivered while the counterpart shows a
//! document from the bound origin; inbound messages are only accepted from the
//! bound context *and* the bound origin.
//!
//! A channel has at most one outstanding receive. While receiving it may pass
//! through the `AwaitingEventAck` sub-state: an `event` from the counterpart is
//! handed to the registered listener, and only once the listener's future has
//! settled is `continue` sent and the original receive resumed.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;

use crate::context::{ContextHandle, Endpoint};
use crate::error::{protocol_err, Error, Result};
use crate::message::{Event, Message, MessageType, Probe};

/// Handles an `event` escalated by the counterpart. The returned future is the
/// "wait-until" promise: the counterpart is not acknowledged until it settles.
pub type EventListener = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Cancels the outstanding receive of a channel with [`Error::Aborted`].
///
/// An abort raised while no receive is outstanding cancels the next one.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<Notify>);

impl AbortSignal {
    /// Abort the outstanding receive.
    pub fn abort(&self) {
        self.0.notify_one();
    }
}

/// Receive state of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// No receive outstanding.
    Idle,
    /// Waiting for one of the accepted message types.
    Receiving,
    /// An event listener is running; the receive resumes once it settles.
    AwaitingEventAck,
}

/// Puts a channel back to `Idle` when a receive ends, including when the
/// receive future is dropped part way (timeout or cancellation).
struct ReceiveGuard<'a>(&'a Mutex<ChannelState>);

impl<'a> ReceiveGuard<'a> {
    fn enter(state: &'a Mutex<ChannelState>) -> Self {
        *state.lock().unwrap_or_else(PoisonError::into_inner) = ChannelState::Receiving;
        Self(state)
    }

    fn set(&self, state: ChannelState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Drop for ReceiveGuard<'_> {
    fn drop(&mut self) {
        self.set(ChannelState::Idle);
    }
}

/// A channel bound to one counterpart context and origin.
pub struct Channel {
    local: Endpoint,
    remote: ContextHandle,
    listener: Option<EventListener>,
    abort: AbortSignal,
    state: Mutex<ChannelState>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local", &self.local.id())
            .field("remote", &self.remote.id())
            .field("origin", self.remote.origin())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Bind a channel between the local document and `remote`.
    #[must_use]
    pub fn bind(local: Endpoint, remote: ContextHandle) -> Self {
        Self {
            local,
            remote,
            listener: None,
            abort: AbortSignal::default(),
            state: Mutex::new(ChannelState::Idle),
        }
    }

    /// Register the listener for escalated events, replacing any previous one.
    pub fn on_event(&mut self, listener: EventListener) {
        self.listener = Some(listener);
    }

    /// A signal that aborts this channel's outstanding receive.
    #[must_use]
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// The counterpart context.
    #[must_use]
    pub const fn remote(&self) -> &ContextHandle {
        &self.remote
    }

    /// Current receive state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a message to the counterpart. No acknowledgement is expected.
    pub fn send(&self, type_: MessageType, data: Value) {
        self.send_message(&Message::new(type_, data));
    }

    /// Send a prepared message, e.g. one relayed on behalf of another origin.
    pub fn send_message(&self, message: &Message) {
        tracing::debug!(type_ = %message.type_, to = %self.remote.origin(), "send");
        self.remote.post(&self.local, message.encode());
    }

    /// Wait for the first message from the counterpart whose type is in
    /// `accept`.
    ///
    /// Messages from the bound context with a different origin are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the counterpart sends a malformed message
    /// or one whose type is not accepted, and [`Error::Aborted`] if the receive
    /// is aborted.
    pub async fn receive(&mut self, accept: &[MessageType]) -> Result<Message> {
        let guard = ReceiveGuard::enter(&self.state);
        self.receive_inner(&guard, accept).await
    }

    async fn receive_inner(&self, guard: &ReceiveGuard<'_>, accept: &[MessageType]) -> Result<Message> {
        loop {
            let envelope = tokio::select! {
                biased;
                () = self.abort.0.notified() => return Err(Error::Aborted),
                envelope = self.local.mailbox().next_from(self.remote.id()) => envelope,
            };
            if &envelope.origin != self.remote.origin() {
                tracing::debug!(
                    expected = %self.remote.origin(),
                    actual = %envelope.origin,
                    "dropping message from unexpected origin"
                );
                continue;
            }

            let message = Message::decode(envelope.data)?;
            tracing::debug!(type_ = %message.type_, from = %envelope.origin, "receive");

            if message.type_ == MessageType::Event {
                self.acknowledge_event(guard, message.data).await?;
                continue;
            }
            if accept.contains(&message.type_) {
                return Ok(message);
            }

            let expected = accept.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            return Err(protocol_err!("unexpected message `{}`, expected one of [{expected}]", message.type_));
        }
    }

    async fn acknowledge_event(&self, guard: &ReceiveGuard<'_>, data: Value) -> Result<()> {
        let event: Event =
            serde_json::from_value(data).map_err(|e| protocol_err!("malformed event: {e}"))?;
        tracing::debug!(name = %event.name, "event");

        if let Some(listener) = &self.listener {
            guard.set(ChannelState::AwaitingEventAck);
            let wait_until = listener(event);
            tokio::select! {
                biased;
                () = self.abort.0.notified() => return Err(Error::Aborted),
                () = wait_until => {}
            }
            guard.set(ChannelState::Receiving);
        }
        self.send(MessageType::Continue, Value::Null);
        Ok(())
    }

    /// Wait for a `request` probe that accepts `type_`, then answer it with
    /// `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the probe does not accept `type_`.
    pub async fn serve(&mut self, type_: MessageType, data: Value) -> Result<()> {
        self.serve_message(Message::new(type_, data)).await
    }

    /// As [`Self::serve`], for a prepared message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the probe does not accept the message's
    /// type.
    pub async fn serve_message(&mut self, message: Message) -> Result<()> {
        let type_ = message.type_;
        let probe = self.receive(&[MessageType::Request]).await?;
        let probe: Probe =
            serde_json::from_value(probe.data).map_err(|e| protocol_err!("malformed request: {e}"))?;
        if !probe.accept.contains(&type_) {
            return Err(protocol_err!("counterpart did not request `{type_}`"));
        }
        self.send_message(&message);
        Ok(())
    }

    /// Ask the counterpart for one of the `accept` types and wait for it. The
    /// answer carries its own type, so the caller can tell which arrived.
    ///
    /// # Errors
    ///
    /// As [`Self::receive`].
    pub async fn request(&mut self, accept: &[MessageType]) -> Result<Message> {
        let probe = Probe { accept: accept.to_vec() };
        self.send(MessageType::Request, serde_json::to_value(probe)?);
        self.receive(accept).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::context::{ContextMode, ContextState};
    use crate::message::{Operation, Phase};

    /// Two contexts with a channel bound in each direction.
    fn pair() -> (Channel, Channel) {
        let rp = ContextState::top_level("https://rp.example".parse().unwrap()).endpoint();
        let agent = ContextState::top_level("https://mediator.example".parse().unwrap()).endpoint();
        let to_agent = ContextHandle::new(Arc::clone(agent.state()), agent.origin().clone(), ContextMode::TopLevel);
        let to_rp = ContextHandle::wrap(&rp);
        (Channel::bind(rp, to_agent), Channel::bind(agent, to_rp))
    }

    const GET_RESULT: MessageType = MessageType::Operation(Operation::Get, Phase::Result);
    const GET_PARAMS: MessageType = MessageType::Operation(Operation::Get, Phase::Params);

    #[tokio::test]
    async fn serve_answers_request() {
        let (mut rp, mut agent) = pair();
        let served = rp.serve(GET_PARAMS, json!({"query": {"foo": ""}}));
        let requested = agent.request(&[GET_PARAMS]);
        let (served, requested) = tokio::join!(served, requested);
        served.unwrap();
        assert_eq!(requested.unwrap().data, json!({"query": {"foo": ""}}));
    }

    #[tokio::test]
    async fn serve_rejects_probe_for_other_type() {
        let (mut rp, mut agent) = pair();
        let store_params = Operation::Store.phase(Phase::Params);
        agent.send(MessageType::Request, json!({"accept": [store_params.to_string()]}));
        let err = rp.serve(GET_PARAMS, json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn unexpected_type_is_protocol_error() {
        let (mut rp, agent) = pair();
        agent.send(Operation::Store.phase(Phase::Result), json!({}));
        let err = rp.receive(&[GET_RESULT]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(rp.state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn accepts_any_type_in_set() {
        let (mut rp, agent) = pair();
        let abort = Operation::Get.phase(Phase::Abort);
        agent.send(abort, Value::Null);
        let msg = rp.receive(&[GET_RESULT, abort]).await.unwrap();
        assert_eq!(msg.type_, abort);
    }

    #[tokio::test]
    async fn foreign_origin_is_dropped() {
        let (mut rp, agent) = pair();

        // the agent's context navigates to another origin and posts from there
        let hijacked = agent.local.state().load("https://evil.example".parse().unwrap());
        agent.remote.post(&hijacked, Message::new(GET_RESULT, json!({"id": "x"})).encode());

        let pending = tokio::time::timeout(Duration::from_millis(50), rp.receive(&[GET_RESULT])).await;
        assert!(pending.is_err(), "message from foreign origin was delivered");
    }

    #[tokio::test]
    async fn event_is_acknowledged_after_listener() {
        let (mut rp, mut agent) = pair();
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        rp.on_event(Arc::new(move |event: Event| {
            assert_eq!(event.name, "repository");
            let flag = Arc::clone(&flag);
            async move {
                tokio::task::yield_now().await;
                flag.store(true, Ordering::SeqCst);
            }
            .boxed()
        }));

        agent.send(MessageType::Event, json!({"name": "repository", "data": {}}));
        let emitter = async {
            let ack = agent.receive(&[MessageType::Continue]).await.unwrap();
            assert!(seen.load(Ordering::SeqCst), "continue sent before listener settled");
            agent.send(GET_RESULT, json!({"id": "x"}));
            ack
        };
        let (result, ack) = tokio::join!(rp.receive(&[GET_RESULT]), emitter);
        assert_eq!(ack.type_, MessageType::Continue);
        assert_eq!(result.unwrap().data, json!({"id": "x"}));
    }

    #[tokio::test]
    async fn cancelled_receive_leaves_channel_idle() {
        let (mut rp, _agent) = pair();
        let pending = tokio::time::timeout(Duration::from_millis(10), rp.receive(&[GET_RESULT])).await;
        assert!(pending.is_err());
        assert_eq!(rp.state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn dropped_receive_during_event_resets_state() {
        let (mut rp, agent) = pair();
        rp.on_event(Arc::new(|_event: Event| std::future::pending::<()>().boxed()));
        agent.send(MessageType::Event, json!({"name": "repository"}));

        let mut receive = Box::pin(rp.receive(&[GET_RESULT]));
        let pending = tokio::time::timeout(Duration::from_millis(10), &mut receive).await;
        assert!(pending.is_err());
        drop(receive);
        assert_eq!(rp.state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn abort_rejects_outstanding_receive() {
        let (mut rp, _agent) = pair();
        let signal = rp.abort_signal();
        let receive = rp.receive(&[GET_RESULT]);
        let abort = async {
            tokio::task::yield_now().await;
            signal.abort();
        };
        let (result, ()) = tokio::join!(receive, abort);
        assert!(result.unwrap_err().is_aborted());
    }
}
