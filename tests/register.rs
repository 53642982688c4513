//! Tests for identity registration and permission flows.

mod provider;

use credibil_mediator::credential::IDENTITY_CONTEXT;
use credibil_mediator::{Error, IdentityRegistration, Operation, ProtocolVersion, RegisterOptions};
use serde_json::json;

use crate::provider::{harness, options, Decision};

fn register_options(version: ProtocolVersion) -> RegisterOptions {
    RegisterOptions {
        idp: Some("did:example:idp".into()),
        registration_callback: Some("https://idp.example/register".into()),
        flow: options(version),
    }
}

#[tokio::test]
async fn register_did() {
    for version in [ProtocolVersion::Current, ProtocolVersion::Legacy] {
        let mut harness = harness(Decision::Complete(json!({"id": "did:example:123"})), version);
        let registration = IdentityRegistration::new(harness.requester.clone());

        let credential = registration
            .register(register_options(version))
            .await
            .expect("should register")
            .expect("should not be aborted");
        assert_eq!(credential.id(), Some("did:example:123"), "{version:?}");

        let seen = harness.seen.recv().await.expect("idp should see the request");
        assert_eq!(seen.op, Operation::RegisterDid);
        assert_eq!(
            seen.params,
            json!({
                "@context": IDENTITY_CONTEXT,
                "idp": "did:example:idp",
                "registrationCallback": "https://idp.example/register",
            })
        );
    }
}

#[tokio::test]
async fn register_requires_idp_and_callback() {
    let harness = harness(Decision::Hang, ProtocolVersion::Current);
    let registration = IdentityRegistration::new(harness.requester.clone());

    let mut options = register_options(ProtocolVersion::Current);
    options.idp = None;
    let err = registration.register(options).await.expect_err("should fail validation");
    let Error::Validation(message) = err else {
        panic!("expected validation error, got {err}");
    };
    assert!(message.contains("DID not provided"), "{message}");

    let mut options = register_options(ProtocolVersion::Current);
    options.registration_callback = None;
    let err = registration.register(options).await.expect_err("should fail validation");
    let Error::Validation(message) = err else {
        panic!("expected validation error, got {err}");
    };
    assert!(message.contains("callback URL not provided"), "{message}");
}

#[tokio::test]
async fn permission_granted() {
    let decision = Decision::Complete(json!({
        "permissions": {"credential.get": "granted", "credential.store": "denied"}
    }));
    let mut harness = harness(decision, ProtocolVersion::Current);
    let registration = IdentityRegistration::new(harness.requester.clone());

    let status = registration
        .request_permission(&["credential.get", "credential.store"], options(ProtocolVersion::Current))
        .await
        .expect("should answer");
    assert!(status.granted("credential.get"));
    assert!(!status.granted("credential.store"));
    assert!(!status.granted("credential.other"));

    let seen = harness.seen.recv().await.expect("holder should see the request");
    assert_eq!(seen.op, Operation::RequestPermission);
    assert_eq!(seen.params, json!({"permissions": ["credential.get", "credential.store"]}));
}

// A permission request has no neutral answer: cancelling it is an error.
#[tokio::test]
async fn permission_cancelled() {
    let harness = harness(Decision::Cancel, ProtocolVersion::Current);
    let registration = IdentityRegistration::new(harness.requester.clone());

    let err = registration
        .request_permission(&["credential.get"], options(ProtocolVersion::Current))
        .await
        .expect_err("cancel should fail");
    assert!(err.is_aborted(), "{err}");
}

#[tokio::test]
async fn permission_requires_names() {
    let harness = harness(Decision::Hang, ProtocolVersion::Current);
    let registration = IdentityRegistration::new(harness.requester.clone());
    let err = registration.request_permission(&[], options(ProtocolVersion::Current)).await.expect_err("should fail");
    assert!(matches!(err, Error::Validation(_)), "{err}");
}
