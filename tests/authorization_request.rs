use std::sync::Arc;

use serde_json::json;
use siopv2::{
    core::{
        authorization_request::{
            opts::{
                CreateAuthorizationRequestOpts, PassBy, RequestObjectOpts,
                VerifyAuthorizationRequestOpts,
            },
            uri::Uri,
            AuthorizationRequest,
        },
        jwt,
        linked_domain::CheckLinkedDomain,
        object::UntypedObject,
        presentation_exchange::PresentationExchange,
        signer::SignatureType,
        util::AsyncHttpClient,
        version::SupportedVersion,
    },
    Error,
};


use fixtures::{registration, resolver, rp_signature, MockHttpClient, RP_DID};

const REFERENCE: &str = "https://rp.acme.com/siop/jwts";

fn opts(pass_by: PassBy) -> CreateAuthorizationRequestOpts {
    CreateAuthorizationRequestOpts {
        client_id: Some("test_client_id".into()),
        redirect_uri: Some("https://acme.com/hello".parse().unwrap()),
        request_object: Some(RequestObjectOpts {
            pass_by,
            reference_uri: Some(REFERENCE.parse().unwrap()),
            signature: Some(rp_signature()),
        }),
        client_metadata: Some(registration()),
        ..Default::default()
    }
}

#[tokio::test]
async fn by_reference_request_object() {
    let http = Arc::new(MockHttpClient::default());
    let request = AuthorizationRequest::from_opts(opts(PassBy::Reference), http.clone())
        .await
        .unwrap();

    let uri = request.uri().await.unwrap();
    assert!(uri
        .encoded_uri()
        .contains("request_uri=https%3A%2F%2Frp.acme.com%2Fsiop%2Fjwts"));
    assert_eq!(request.payload().request_uri(), Some(REFERENCE));

    let token = request.request_object_jwt().await.unwrap().unwrap();
    let claims = jwt::decode(&token).unwrap().payload;
    assert_eq!(claims.get_str("response_type"), Some("id_token"));
    assert_eq!(claims.get_str("scope"), Some("openid"));
    assert_eq!(claims.get_str("client_id"), Some("test_client_id"));
    assert_eq!(claims.get_str("redirect_uri"), Some("https://acme.com/hello"));
    assert_eq!(claims.get_str("iss"), Some(RP_DID));
    assert_eq!(
        claims.get_raw("registration").unwrap()["subject_syntax_types_supported"],
        json!(["did:ethr:", "did"])
    );

    // Signing happened while building, nothing went over the wire.
    assert_eq!(http.request_count(), 0);

    // The OP fetches the token from where the RP serves it.
    let op_http = Arc::new(MockHttpClient::default());
    op_http.serve(REFERENCE, 200, &token);
    let verify = VerifyAuthorizationRequestOpts::new(Arc::new(resolver(None)), op_http.clone())
        .with_check_linked_domain(CheckLinkedDomain::Never);
    let verified = AuthorizationRequest::verify_uri_or_jwt(uri.encoded_uri(), &verify)
        .await
        .unwrap();
    assert_eq!(verified.issuer(), Some(RP_DID));
    assert_eq!(verified.payload.client_id().as_deref(), Some("test_client_id"));
    assert_eq!(op_http.bodies(REFERENCE).len(), 1);
}

#[tokio::test]
async fn by_value_request_object() {
    let request = AuthorizationRequest::from_opts(
        opts(PassBy::Value),
        Arc::new(MockHttpClient::default()),
    )
    .await
    .unwrap();
    let uri = request.uri().await.unwrap();

    let parsed = Uri::parse(uri.encoded_uri()).unwrap();
    let token = parsed.authorization_request_payload().request().unwrap();
    assert!(jwt::is_compact_jwt(token));
    assert_eq!(token.split('.').count(), 3);

    // Two calls, one token.
    assert_eq!(
        request.request_object_jwt().await.unwrap().as_deref(),
        Some(token)
    );
    assert_eq!(
        request.request_object_jwt().await.unwrap(),
        request.request_object_jwt().await.unwrap()
    );
}

#[tokio::test]
async fn missing_request_object_options() {
    let http = Arc::new(MockHttpClient::default());
    let opts = CreateAuthorizationRequestOpts {
        request_object: None,
        ..opts(PassBy::Value)
    };
    let err = AuthorizationRequest::from_opts(opts, http.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadParams(_)));
    assert_eq!(http.request_count(), 0);
}

#[tokio::test]
async fn reference_without_url() {
    let mut opts = opts(PassBy::Reference);
    if let Some(ro) = opts.request_object.as_mut() {
        ro.reference_uri = None;
    }
    let err = AuthorizationRequest::from_opts(opts, Arc::new(MockHttpClient::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadParams(_)));
}

#[tokio::test]
async fn definition_without_descriptors() {
    let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
    for definition in [
        json!({ "id": "pd" }),
        json!({ "id": "pd", "input_descriptors": [] }),
        json!({ "id": "pd", "name": "Otherwise fine", "purpose": "Testing", "input_descriptors": null }),
    ] {
        let payload: UntypedObject = json!({
            "claims": { "vp_token": { "presentation_definition": definition } }
        })
        .try_into()
        .unwrap();
        let err = PresentationExchange::find_valid_presentation_definitions(
            &payload,
            None,
            client.as_ref(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ValidationFailure(_)), "{err}");
    }
}

#[tokio::test]
async fn uri_round_trip() {
    let request = AuthorizationRequest::from_opts(
        CreateAuthorizationRequestOpts {
            nonce: Some("qBrR7mqnY3Qr49dAZycPF8FzgE83m6H0c2l0bzP4xSg".into()),
            state: Some("b32f0087fc9816eb813fd11f".into()),
            claims: Some(json!({
                "vp_token": { "presentation_definition": fixtures::membership_definition() }
            })),
            ..opts(PassBy::None)
        },
        Arc::new(MockHttpClient::default()),
    )
    .await
    .unwrap();

    let uri = request.uri().await.unwrap();
    let parsed = AuthorizationRequest::from_uri(uri.encoded_uri(), &MockHttpClient::default())
        .await
        .unwrap();
    assert_eq!(parsed.payload(), request.payload());
    assert_eq!(
        parsed.to_state_info().state.as_deref(),
        Some("b32f0087fc9816eb813fd11f")
    );
}

#[tokio::test]
async fn unsupported_dialect() {
    // Top level presentation definitions with the id1 required parameters missing.
    let payload: UntypedObject = json!({
        "client_id": RP_DID,
        "presentation_definition": fixtures::membership_definition(),
        "registration": { "subject_syntax_types_supported": ["did"] }
    })
    .try_into()
    .unwrap();
    let request =
        AuthorizationRequest::from_payload(payload.into(), &MockHttpClient::default())
            .await
            .unwrap();
    let verify = VerifyAuthorizationRequestOpts::new(
        Arc::new(resolver(None)),
        Arc::new(MockHttpClient::default()),
    )
    .with_check_linked_domain(CheckLinkedDomain::Never)
    .with_supported_versions(vec![
        SupportedVersion::SiopV2Id1,
        SupportedVersion::JwtVcPresentationProfileV1,
    ]);
    let err = request.verify(&verify).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion(_)));
}

#[test]
fn loose_signature_shapes() {
    assert!(matches!(
        SignatureType::try_from(json!({})),
        Err(Error::BadSignatureParams(_))
    ));
    assert!(matches!(
        SignatureType::try_from(json!({ "hexPrivateKey": "f857", "did": RP_DID, "kid": "k" })),
        Ok(SignatureType::Internal(_))
    ));
}
