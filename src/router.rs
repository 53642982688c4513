//! # Router
//!
//! The passive side of the handshake. A router talks to the context that
//! created ours (opener or parent) through a borrowed handle: it never owns
//! or closes that context.

use serde_json::Value;

use crate::channel::Channel;
use crate::context::{ContextHandle, Endpoint};
use crate::error::Result;
use crate::message::{Event, Message, MessageType};

/// Serves requests from, and sends results to, the context that created ours.
#[derive(Debug)]
pub struct Router {
    channel: Channel,
}

impl Router {
    /// Create a router between the local document and the context that
    /// created it.
    #[must_use]
    pub fn new(local: Endpoint, counterpart: ContextHandle) -> Self {
        Self {
            channel: Channel::bind(local, counterpart),
        }
    }

    /// The context this router talks to.
    #[must_use]
    pub const fn counterpart(&self) -> &ContextHandle {
        self.channel.remote()
    }

    /// Ask the counterpart for one of the `accept` types.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the counterpart answers with anything else.
    pub async fn request(&mut self, accept: &[MessageType]) -> Result<Message> {
        self.channel.request(accept).await
    }

    /// Wait for the counterpart to push one of the `accept` types.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the counterpart sends anything else.
    pub async fn receive(&mut self, accept: &[MessageType]) -> Result<Message> {
        self.channel.receive(accept).await
    }

    /// Answer the counterpart's `request` probe with `data`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the probe does not ask for `type_`.
    pub async fn serve(&mut self, type_: MessageType, data: Value) -> Result<()> {
        self.channel.serve(type_, data).await
    }

    /// Push a message to the counterpart.
    pub fn send(&self, type_: MessageType, data: Value) {
        self.channel.send(type_, data);
    }

    /// Push a prepared message to the counterpart.
    pub fn send_message(&self, message: &Message) {
        self.channel.send_message(message);
    }

    /// Legacy: ask the counterpart to navigate its context onward.
    pub fn navigate(&self) {
        self.channel.send(MessageType::Navigate, Value::Null);
    }

    /// Escalate an event to the counterpart and wait until its listener has
    /// settled.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the counterpart answers with anything other
    /// than `continue`.
    pub async fn emit(&mut self, name: &str, data: Value) -> Result<()> {
        let event = Event {
            name: name.to_string(),
            data,
        };
        self.channel.send(MessageType::Event, serde_json::to_value(event)?);
        self.channel.receive(&[MessageType::Continue]).await?;
        Ok(())
    }
}
