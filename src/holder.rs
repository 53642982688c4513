//! # Holder API
//!
//! Entry points for a holder (repository or identity provider) page opened
//! by the mediator: claim the pending operation, then answer it exactly once.

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::FlowOptions;
use crate::context::Window;
use crate::error::Result;
use crate::flow::{self, PendingRequest};
use crate::message::{Operation, Phase};
use crate::origin::Origin;
use crate::requester::CredentialsContainer;

impl<W: Window> CredentialsContainer<W> {
    /// Claim the operation pending for this page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page was not opened by a mediator, or the
    /// mediator does not answer with a pending operation.
    pub async fn get_pending_operation(&self, options: &FlowOptions) -> Result<PendingOperation<'_, W>> {
        let request = flow::resume(&self.window, options).await?;
        Ok(PendingOperation {
            window: &self.window,
            request,
        })
    }
}

/// An operation claimed by a holder. Answering consumes it.
#[derive(Debug)]
pub struct PendingOperation<'a, W> {
    window: &'a W,
    request: PendingRequest,
}

impl<W: Window> PendingOperation<'_, W> {
    /// The operation requested.
    #[must_use]
    pub const fn name(&self) -> Operation {
        self.request.op
    }

    /// The requester's parameters.
    #[must_use]
    pub const fn options(&self) -> &Value {
        &self.request.params
    }

    /// Origin the operation was received from: the mediator, or its agent
    /// frame.
    #[must_use]
    pub const fn origin(&self) -> &Origin {
        &self.request.origin
    }

    /// Origin of the requester that started the operation, as reported by
    /// the mediator.
    #[must_use]
    pub const fn requester(&self) -> Option<&Origin> {
        self.request.requester.as_ref()
    }

    /// Answer the operation with `result`.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be serialized or the answer
    /// cannot be delivered.
    pub async fn complete(self, result: impl Serialize + Send, options: &FlowOptions) -> Result<()> {
        let data = serde_json::to_value(result)?;
        flow::end(self.window, self.request.op, Phase::Result, data, options).await
    }

    /// Decline the operation. The requester resolves without a result.
    ///
    /// # Errors
    ///
    /// Returns an error if the answer cannot be delivered.
    pub async fn cancel(self, options: &FlowOptions) -> Result<()> {
        flow::end(self.window, self.request.op, Phase::Abort, Value::Null, options).await
    }

    /// Fail the operation with `message`. The requester's call fails with a
    /// remote error.
    ///
    /// # Errors
    ///
    /// Returns an error if the answer cannot be delivered.
    pub async fn fail(self, message: &str, options: &FlowOptions) -> Result<()> {
        flow::end(self.window, self.request.op, Phase::Error, json!({"message": message}), options).await
    }
}
