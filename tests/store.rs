//! Tests for `store` flows.

mod provider;

use credibil_mediator::{Credential, Error, IdentityCredential, Operation, ProtocolVersion};
use insta::assert_yaml_snapshot;
use serde_json::{json, Value};

use crate::provider::{harness, options, Decision};

// Both protocol generations hand the credential to the repository and return
// the repository's copy. Only the current generation embeds the repository.
#[tokio::test]
async fn store_both_versions() {
    let credential: Credential = IdentityCredential::new("urn:credential:1").claim("name", "Alice").into();

    for (version, embedded) in [(ProtocolVersion::Current, true), (ProtocolVersion::Legacy, false)] {
        let mut harness = harness(Decision::Echo, version);

        let stored = harness
            .container()
            .store(credential.clone(), options(version))
            .await
            .expect("should store")
            .expect("should not be aborted");
        assert_eq!(stored, credential, "{version:?}");

        let seen = harness.seen.recv().await.expect("repository should see the request");
        assert_eq!(seen.op, Operation::Store);
        assert_eq!(seen.embedded, embedded, "{version:?}");
    }
}

#[tokio::test]
async fn store_params() {
    let mut harness = harness(Decision::Complete(Value::Null), ProtocolVersion::Current);
    let credential = Credential::Opaque(json!({"id": "urn:credential:2", "type": ["VerifiableCredential"]}));

    let stored = harness.container().store(credential, options(ProtocolVersion::Current)).await.expect("should store");
    assert_eq!(stored, None, "a null result resolves without a credential");

    let seen = harness.seen.recv().await.expect("repository should see the request");
    assert_yaml_snapshot!(seen.params, @r#"
    id: "urn:credential:2"
    type:
      - VerifiableCredential
    "#);
}

#[tokio::test]
async fn store_requires_credential() {
    let harness = harness(Decision::Hang, ProtocolVersion::Current);
    let err = harness
        .container()
        .store(Credential::Opaque(Value::Null), options(ProtocolVersion::Current))
        .await
        .expect_err("should fail validation");
    assert!(matches!(err, Error::Validation(_)), "{err}");
}

// A cancelled legacy relay still carries the cancellation back through the
// agent's result hop.
#[tokio::test]
async fn legacy_cancel() {
    let harness = harness(Decision::Cancel, ProtocolVersion::Legacy);
    let credential: Credential = IdentityCredential::new("urn:credential:3").into();
    let stored = harness.container().store(credential, options(ProtocolVersion::Legacy)).await.expect("should resolve");
    assert_eq!(stored, None);
}
