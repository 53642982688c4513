//! # Context Handles
//!
//! A context is an isolated execution environment (a top-level window, an
//! embedded frame, or an existing opener/parent) identified by its id and
//! addressed by its origin. A [`ContextHandle`] is a reference to another
//! context: messages can be posted to it, it can be closed and, for
//! contexts we opened, shown or hidden.
//!
//! The local side of a context is an [`Endpoint`]: the identity and mailbox
//! of the document currently loaded in it.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::AbortHandle;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::store::SessionStore;

/// Identifies a context for its whole lifetime, across navigations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// How a context is hosted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextMode {
    /// A new top-level context (popup or tab).
    TopLevel,
    /// A frame embedded in the opening context.
    Embedded,
    /// A context that already exists (our opener or parent).
    Existing,
}

/// The operations a context offers to the protocol code running in it.
///
/// The in-memory [`crate::browser::Page`] is the provided implementation.
pub trait Window: Send + Sync {
    /// The local endpoint of the document running in this context.
    fn endpoint(&self) -> &Endpoint;

    /// The URL of the document running in this context.
    fn url(&self) -> &Url;

    /// The context that opened this one as a top-level context.
    fn opener(&self) -> Option<ContextHandle>;

    /// The context this one is embedded in.
    fn parent(&self) -> Option<ContextHandle>;

    /// Session storage for this context's origin and tab.
    fn session_store(&self) -> Arc<SessionStore>;

    /// Open a new context at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextBlocked`] if the context cannot be created.
    fn open(&self, url: &Url, mode: ContextMode) -> impl Future<Output = Result<ContextHandle>> + Send;

    /// Replace the document running in this context with `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing can be loaded at `url`.
    fn navigate(&self, url: &Url) -> Result<()>;

    /// The opener or parent: the context this one was created for.
    fn counterpart(&self) -> Option<ContextHandle> {
        self.parent().or_else(|| self.opener())
    }
}

/// A message as delivered to a mailbox.
#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub source: ContextId,
    pub origin: Origin,
    pub data: Value,
}

/// Queue of inbound messages for one document.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Mailbox {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, envelope: Envelope) {
        self.queue().push_back(envelope);
        self.notify.notify_waiters();
    }

    fn clear(&self) {
        self.queue().clear();
    }

    /// Wait for the next message posted by `source`, in arrival order.
    /// Messages from other sources stay queued for their own channels.
    pub async fn next_from(&self, source: ContextId) -> Envelope {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue();
                if let Some(pos) = queue.iter().position(|e| e.source == source) {
                    if let Some(envelope) = queue.remove(pos) {
                        return envelope;
                    }
                }
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct Document {
    origin: Origin,
    mailbox: Arc<Mailbox>,
}

/// Shared lifecycle state of one context.
#[derive(Debug)]
pub(crate) struct ContextState {
    id: ContextId,
    tab: ContextId,
    document: RwLock<Document>,
    closed: watch::Sender<bool>,
    visible: AtomicBool,
    task: Mutex<Option<AbortHandle>>,
    children: Mutex<Vec<Arc<ContextState>>>,
}

impl ContextState {
    /// A new top-level context, which starts its own tab.
    pub fn top_level(origin: Origin) -> Arc<Self> {
        let id = ContextId::new();
        Arc::new(Self::new(id, id, origin))
    }

    /// A new context embedded in `parent`, sharing its tab.
    pub fn embedded(parent: &Arc<Self>, origin: Origin) -> Arc<Self> {
        let state = Arc::new(Self::new(ContextId::new(), parent.tab, origin));
        parent.children.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::clone(&state));
        state
    }

    fn new(id: ContextId, tab: ContextId, origin: Origin) -> Self {
        Self {
            id,
            tab,
            document: RwLock::new(Document {
                origin,
                mailbox: Arc::new(Mailbox::default()),
            }),
            closed: watch::Sender::new(false),
            visible: AtomicBool::new(false),
            task: Mutex::new(None),
            children: Mutex::new(Vec::new()),
        }
    }

    pub const fn id(&self) -> ContextId {
        self.id
    }

    pub const fn tab(&self) -> ContextId {
        self.tab
    }

    pub fn origin(&self) -> Origin {
        self.document.read().unwrap_or_else(PoisonError::into_inner).origin.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Load a new document: new origin, fresh mailbox. Returns the endpoint
    /// for the new document.
    pub fn load(self: &Arc<Self>, origin: Origin) -> Endpoint {
        let mailbox = Arc::new(Mailbox::default());
        let mut document = self.document.write().unwrap_or_else(PoisonError::into_inner);
        document.mailbox.clear();
        *document = Document {
            origin: origin.clone(),
            mailbox: Arc::clone(&mailbox),
        };
        Endpoint {
            state: Arc::clone(self),
            origin,
            mailbox,
        }
    }

    /// The endpoint of the document currently loaded.
    pub fn endpoint(self: &Arc<Self>) -> Endpoint {
        let document = self.document.read().unwrap_or_else(PoisonError::into_inner);
        Endpoint {
            state: Arc::clone(self),
            origin: document.origin.clone(),
            mailbox: Arc::clone(&document.mailbox),
        }
    }

    /// Record the task running the current document so closing or navigating
    /// the context stops it.
    pub fn set_task(&self, task: AbortHandle) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn post(&self, envelope: Envelope, target_origin: &Origin) {
        if self.is_closed() {
            tracing::debug!(target = %self.id, "dropping message posted to closed context");
            return;
        }
        let document = self.document.read().unwrap_or_else(PoisonError::into_inner);
        if &document.origin != target_origin {
            tracing::debug!(
                target = %self.id,
                expected = %target_origin,
                actual = %document.origin,
                "dropping message: target origin mismatch"
            );
            return;
        }
        document.mailbox.deliver(envelope);
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        tracing::debug!(context = %self.id, "closing context");
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let children =
            std::mem::take(&mut *self.children.lock().unwrap_or_else(PoisonError::into_inner));
        for child in children {
            child.close();
        }
        self.document.read().unwrap_or_else(PoisonError::into_inner).mailbox.clear();
    }
}

/// The local side of a context: the document currently running in it.
#[derive(Clone, Debug)]
pub struct Endpoint {
    state: Arc<ContextState>,
    origin: Origin,
    mailbox: Arc<Mailbox>,
}

impl Endpoint {
    /// The context id.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.state.id()
    }

    /// The origin of the document.
    #[must_use]
    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub(crate) const fn state(&self) -> &Arc<ContextState> {
        &self.state
    }
}

/// A reference to another context.
#[derive(Clone, Debug)]
pub struct ContextHandle {
    state: Arc<ContextState>,
    origin: Origin,
    mode: ContextMode,
}

impl ContextHandle {
    pub(crate) const fn new(state: Arc<ContextState>, origin: Origin, mode: ContextMode) -> Self {
        Self { state, origin, mode }
    }

    /// Wrap the existing context behind `endpoint`, e.g. as the opener or
    /// parent handed to a context it creates.
    pub(crate) fn wrap(endpoint: &Endpoint) -> Self {
        Self::new(Arc::clone(&endpoint.state), endpoint.origin.clone(), ContextMode::Existing)
    }

    /// The id of the referenced context.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.state.id()
    }

    /// The origin the context was declared with. Messages are only delivered
    /// while the context's document has this origin.
    #[must_use]
    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    /// How the context is hosted.
    #[must_use]
    pub const fn mode(&self) -> ContextMode {
        self.mode
    }

    /// Post a message from `source`. Messages are silently dropped when the
    /// context is closed or no longer shows a document from [`Self::origin`].
    pub(crate) fn post(&self, source: &Endpoint, data: Value) {
        let envelope = Envelope {
            source: source.id(),
            origin: source.origin().clone(),
            data,
        };
        self.state.post(envelope, &self.origin);
    }

    /// Close the context. Safe to call any number of times.
    pub fn close(&self) {
        self.state.close();
    }

    /// Whether the context has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Resolves once the context has been closed, by us or by the user.
    pub async fn closed(&self) {
        let mut rx = self.state.closed.subscribe();
        // the sender lives in the shared state we hold, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Make the context visible to the user.
    ///
    /// # Errors
    ///
    /// Returns an error for existing contexts, whose presentation belongs to
    /// their own opener.
    pub fn show(&self) -> Result<()> {
        self.set_visible(true)
    }

    /// Hide the context from the user.
    ///
    /// # Errors
    ///
    /// Returns an error for existing contexts.
    pub fn hide(&self) -> Result<()> {
        self.set_visible(false)
    }

    fn set_visible(&self, visible: bool) -> Result<()> {
        if self.mode == ContextMode::Existing {
            return Err(Error::Validation("visibility of an existing context is not ours".into()));
        }
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        self.state.visible.store(visible, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the context is currently visible.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.state.visible.load(Ordering::SeqCst)
    }
}

/// A context opened by, and exclusively owned by, a flow. The context is
/// closed when the guard is dropped, so every exit path tears it down.
#[derive(Debug)]
pub struct OwnedContext(ContextHandle);

impl OwnedContext {
    /// Take ownership of a context we opened.
    #[must_use]
    pub const fn new(handle: ContextHandle) -> Self {
        Self(handle)
    }
}

impl Deref for OwnedContext {
    type Target = ContextHandle;

    fn deref(&self) -> &ContextHandle {
        &self.0
    }
}

impl Drop for OwnedContext {
    fn drop(&mut self) {
        self.0.close();
    }
}
