//! Test harness: an in-memory browser hosting a mediator and a repository,
//! with a requester page driven by the test.

#![allow(dead_code)]

use credibil_mediator::browser::{Browser, Page};
use credibil_mediator::context::Window;
use credibil_mediator::mediator::{Mediator, MediatorConfig};
use credibil_mediator::{CredentialsContainer, FlowOptions, Operation, Origin, ProtocolVersion};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;

pub const REQUESTER: &str = "https://rp.example";
pub const MEDIATOR: &str = "https://mediator.example";
pub const REPOSITORY: &str = "https://repo.example";
pub const AGENT_URL: &str = "https://mediator.example/agent";
pub const REPOSITORY_URL: &str = "https://repo.example/wallet";

/// What the repository does with the operation it claims.
#[derive(Clone, Debug)]
pub enum Decision {
    /// Complete with the given result.
    Complete(Value),
    /// Complete with the requester's own parameters.
    Echo,
    /// Decline the operation.
    Cancel,
    /// Fail the operation with a message.
    Fail(String),
    /// Never answer.
    Hang,
    /// Close the mediator's context, as the user closing the popup would.
    CloseMediator,
}

/// An operation as the repository saw it.
#[derive(Clone, Debug)]
pub struct Seen {
    pub op: Operation,
    pub params: Value,
    /// The requester's origin as reported by the mediator.
    pub requester: Option<Origin>,
    /// Whether the repository was embedded (current protocol) rather than
    /// navigated to in the requester's popup (legacy protocol).
    pub embedded: bool,
}

pub struct Harness {
    pub browser: Browser,
    pub requester: Page,
    pub seen: mpsc::UnboundedReceiver<Seen>,
}

impl Harness {
    pub fn container(&self) -> CredentialsContainer<Page> {
        CredentialsContainer::new(self.requester.clone())
    }
}

/// Options the requester and repository use for `version`.
pub fn options(version: ProtocolVersion) -> FlowOptions {
    FlowOptions::for_version(version).with_agent_url(AGENT_URL)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

/// A browser with the mediator and a repository that answers with
/// `decision`, speaking protocol `version`.
pub fn harness(decision: Decision, version: ProtocolVersion) -> Harness {
    init_tracing();

    let browser = Browser::new();
    let config = MediatorConfig {
        repository_url: Url::parse(REPOSITORY_URL).expect("should parse"),
        announce_repository: true,
    };
    browser.host(MEDIATOR, Mediator::new(config)).expect("should host mediator");

    let (tx, seen) = mpsc::unbounded_channel();
    browser
        .host(REPOSITORY, move |page: Page| {
            let decision = decision.clone();
            let tx = tx.clone();
            async move {
                let options = options(version);
                let embedded = page.parent().is_some();
                let mediator = page.parent();
                let own = page.clone();
                let container = CredentialsContainer::new(page);
                let op = container.get_pending_operation(&options).await?;
                let _ = tx.send(Seen {
                    op: op.name(),
                    params: op.options().clone(),
                    requester: op.requester().cloned(),
                    embedded,
                });

                match decision {
                    Decision::Complete(result) => op.complete(result, &options).await?,
                    Decision::Echo => {
                        let params = op.options().clone();
                        op.complete(params, &options).await?;
                    }
                    Decision::Cancel => op.cancel(&options).await?,
                    Decision::Fail(message) => op.fail(&message, &options).await?,
                    Decision::Hang => std::future::pending::<()>().await,
                    Decision::CloseMediator => {
                        // embedded in the mediator's popup, or navigated into it (legacy)
                        match mediator {
                            Some(popup) => popup.close(),
                            None => own.close(),
                        }
                        std::future::pending::<()>().await;
                    }
                }
                anyhow::Ok(())
            }
        })
        .expect("should host repository");

    let requester = browser.launch(&format!("{REQUESTER}/shop")).expect("should launch requester");
    Harness {
        browser,
        requester,
        seen,
    }
}
