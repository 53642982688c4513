//! # In-Memory Host
//!
//! Hosts requester, mediator and holder documents in one process. Each origin
//! is served by an [`App`]; opening or navigating a context to a URL starts that
//! origin's app in a new task with a [`Page`] for the context.
//!
//! The host provides the guarantees the protocol relies on from a browser:
//! - messages are only delivered while the target shows the target origin,
//! - each delivered message carries the sender's context and origin,
//! - navigating replaces the document (and stops its task) but keeps the
//!   context, so handles held by others stay valid,
//! - session storage is scoped by tab and origin; embedded frames share
//!   their parent's tab.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use url::Url;

use crate::context::{ContextHandle, ContextId, ContextMode, ContextState, Endpoint, Window};
use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::store::SessionStore;

/// The document logic served for an origin.
pub trait App: Send + Sync + 'static {
    /// Run the document loaded in `page` until it finishes or its context is
    /// closed or navigated away.
    fn run(&self, page: Page) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> App for F
where
    F: Fn(Page) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(&self, page: Page) -> BoxFuture<'static, anyhow::Result<()>> {
        self(page).boxed()
    }
}

#[derive(Default)]
struct Inner {
    apps: RwLock<HashMap<Origin, Arc<dyn App>>>,
    storage: Mutex<HashMap<(ContextId, Origin), Arc<SessionStore>>>,
    popups_blocked: AtomicBool,
}

/// An in-memory browser hosting one app per origin.
#[derive(Clone, Default)]
pub struct Browser {
    inner: Arc<Inner>,
}

impl fmt::Debug for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let apps = self.inner.apps.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Browser").field("origins", &apps.keys().collect::<Vec<_>>()).finish_non_exhaustive()
    }
}

impl Browser {
    /// An empty browser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `app` for every URL of `origin`.
    ///
    /// # Errors
    ///
    /// Returns an error if `origin` is not a valid origin.
    pub fn host(&self, origin: &str, app: impl App) -> Result<()> {
        let origin: Origin = origin.parse()?;
        self.inner.apps.write().unwrap_or_else(PoisonError::into_inner).insert(origin, Arc::new(app));
        Ok(())
    }

    /// Refuse (or allow again) new top-level contexts.
    pub fn block_popups(&self, blocked: bool) {
        self.inner.popups_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Open a top-level page at `url` driven by the caller rather than by a
    /// hosted app.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is invalid or has an opaque origin.
    pub fn launch(&self, url: &str) -> Result<Page> {
        let url = Url::parse(url)?;
        let origin = Origin::of(&url)?;
        let endpoint = ContextState::top_level(origin).endpoint();
        Ok(Page {
            browser: self.clone(),
            url,
            endpoint,
            opener: None,
            parent: None,
        })
    }

    /// Session storage for `origin` in `tab`.
    #[must_use]
    pub fn storage(&self, tab: ContextId, origin: &Origin) -> Arc<SessionStore> {
        let mut storage = self.inner.storage.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(storage.entry((tab, origin.clone())).or_default())
    }

    fn app(&self, origin: &Origin, url: &Url) -> Result<Arc<dyn App>> {
        let apps = self.inner.apps.read().unwrap_or_else(PoisonError::into_inner);
        apps.get(origin).cloned().ok_or_else(|| Error::ContextBlocked(format!("nothing is hosted at {url}")))
    }

    /// Load `url` into the context and start its app.
    fn load(
        &self, state: &Arc<ContextState>, url: Url, opener: Option<ContextHandle>, parent: Option<ContextHandle>,
    ) -> Result<()> {
        let origin = Origin::of(&url)?;
        let app = self.app(&origin, &url)?;
        let endpoint = state.load(origin);
        tracing::debug!(context = %endpoint.id(), %url, "loading document");

        let page = Page {
            browser: self.clone(),
            url: url.clone(),
            endpoint,
            opener,
            parent,
        };
        let task = tokio::spawn(async move {
            if let Err(e) = app.run(page).await {
                tracing::warn!(%url, "document failed: {e:#}");
            }
        });
        state.set_task(task.abort_handle());
        Ok(())
    }
}

/// A document loaded in a context of the in-memory [`Browser`].
#[derive(Clone)]
pub struct Page {
    browser: Browser,
    url: Url,
    endpoint: Endpoint,
    opener: Option<ContextHandle>,
    parent: Option<ContextHandle>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("url", &self.url.as_str())
            .field("context", &self.endpoint.id())
            .finish_non_exhaustive()
    }
}

impl Page {
    /// The browser hosting this page.
    #[must_use]
    pub const fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Close this page's context, as the user closing the window would.
    pub fn close(&self) {
        ContextHandle::wrap(&self.endpoint).close();
    }

    /// The value of query parameter `name` in this page's URL.
    #[must_use]
    pub fn query(&self, name: &str) -> Option<String> {
        self.url.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
    }
}

impl Window for Page {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn opener(&self) -> Option<ContextHandle> {
        self.opener.clone()
    }

    fn parent(&self) -> Option<ContextHandle> {
        self.parent.clone()
    }

    fn session_store(&self) -> Arc<SessionStore> {
        self.browser.storage(self.endpoint.state().tab(), self.endpoint.origin())
    }

    async fn open(&self, url: &Url, mode: ContextMode) -> Result<ContextHandle> {
        let origin = Origin::of(url)?;
        let this = ContextHandle::wrap(&self.endpoint);

        let (state, opener, parent) = match mode {
            ContextMode::TopLevel => {
                if self.browser.inner.popups_blocked.load(Ordering::SeqCst) {
                    return Err(Error::ContextBlocked(format!("popup to {url} was blocked")));
                }
                (ContextState::top_level(origin.clone()), Some(this), None)
            }
            ContextMode::Embedded => (ContextState::embedded(self.endpoint.state(), origin.clone()), None, Some(this)),
            ContextMode::Existing => {
                return Err(Error::Validation("an existing context cannot be opened".into()));
            }
        };

        self.browser.load(&state, url.clone(), opener, parent)?;
        Ok(ContextHandle::new(state, origin, mode))
    }

    fn navigate(&self, url: &Url) -> Result<()> {
        self.browser.load(self.endpoint.state(), url.clone(), self.opener.clone(), self.parent.clone())
    }
}
