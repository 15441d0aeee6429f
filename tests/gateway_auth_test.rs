use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use toolgate::error::AuthError;
use toolgate::gateway::{AuthenticatorConfig, GatewayAuthenticator, KeySource};

#[path = "support/jwt_fixture.rs"]
mod support;

use support::*;

fn static_config() -> AuthenticatorConfig {
    AuthenticatorConfig::new(Some(ISSUER.to_string()), KeySource::Static(jwks(&[(KID_A, K_A)])))
        .with_allowed_clients([CLIENT_ID])
        .with_algorithms(vec![Algorithm::HS256])
        .with_leeway(Duration::ZERO)
}

fn authenticator(config: AuthenticatorConfig) -> GatewayAuthenticator {
    GatewayAuthenticator::new(config, reqwest::Client::new()).unwrap()
}

#[tokio::test]
async fn valid_token_yields_claims() {
    let auth = authenticator(static_config());
    let token = sign(KID_A, SECRET_A, &m2m_claims("orders:read orders:write", 3600));

    let claims = auth.authenticate(&token).await.unwrap();
    assert_eq!(claims.subject, CLIENT_ID);
    assert_eq!(claims.issuer, ISSUER);
    assert_eq!(claims.client_id.as_deref(), Some(CLIENT_ID));
    assert_eq!(claims.scopes, vec!["orders:read", "orders:write"]);
}

#[tokio::test]
async fn scp_claim_is_accepted_as_scope_list() {
    let auth = authenticator(static_config());
    let token = sign(
        KID_A,
        SECRET_A,
        &json!({
            "sub": "svc",
            "iss": ISSUER,
            "client_id": CLIENT_ID,
            "scp": ["orders:read"],
            "exp": now() + 600,
        }),
    );
    let claims = auth.authenticate(&token).await.unwrap();
    assert!(claims.has_scope("orders:read"));
    assert_eq!(claims.subject, "svc");
}

#[tokio::test]
async fn wrong_issuer_is_invalid_even_with_a_valid_signature() {
    let auth = authenticator(static_config());
    let mut claims = m2m_claims("orders:read", 3600);
    claims["iss"] = json!("https://attacker.example");
    let token = sign(KID_A, SECRET_A, &claims);

    let err = auth.authenticate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");
}

#[tokio::test]
async fn wrong_audience_is_invalid_even_with_a_valid_signature() {
    let auth = authenticator(
        AuthenticatorConfig::new(Some(ISSUER.to_string()), KeySource::Static(jwks(&[(KID_A, K_A)])))
            .with_audiences(["https://gateway.example/orders"])
            .with_algorithms(vec![Algorithm::HS256]),
    );

    let mut claims = m2m_claims("orders:read", 3600);
    claims["aud"] = json!("https://gateway.example/other");
    let err = auth.authenticate(&sign(KID_A, SECRET_A, &claims)).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");

    claims["aud"] = json!(["https://gateway.example/other", "https://gateway.example/orders"]);
    let ok = auth.authenticate(&sign(KID_A, SECRET_A, &claims)).await.unwrap();
    assert_eq!(ok.audiences.len(), 2);
}

#[tokio::test]
async fn unknown_client_is_invalid() {
    let auth = authenticator(static_config());
    let mut claims = m2m_claims("orders:read", 3600);
    claims["client_id"] = json!("someone-else");
    let err = auth.authenticate(&sign(KID_A, SECRET_A, &claims)).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");
}

#[tokio::test]
async fn bad_signature_is_invalid() {
    let auth = authenticator(static_config());
    let token = sign(KID_A, SECRET_B, &m2m_claims("orders:read", 3600));
    let err = auth.authenticate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");
}

#[tokio::test]
async fn expired_token_is_reported_as_expired() {
    let auth = authenticator(static_config());
    let token = sign(KID_A, SECRET_A, &m2m_claims("orders:read", -120));
    let err = auth.authenticate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::ExpiredToken(_)), "{err:?}");
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn algorithms_outside_the_allow_list_are_rejected() {
    let auth = authenticator(static_config());
    let token = sign_with(Algorithm::HS384, KID_A, SECRET_A, &m2m_claims("orders:read", 3600));
    let err = auth.authenticate(&token).await.unwrap_err();
    assert!(matches!(&err, AuthError::InvalidToken(msg) if msg.contains("not accepted")), "{err:?}");
}

#[tokio::test]
async fn garbage_and_unknown_keys_are_invalid() {
    let auth = authenticator(static_config());
    assert!(matches!(
        auth.authenticate("not-a-jwt").await,
        Err(AuthError::InvalidToken(_))
    ));

    let token = sign("key-unknown", SECRET_A, &m2m_claims("orders:read", 3600));
    assert!(matches!(
        auth.authenticate(&token).await,
        Err(AuthError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn remote_key_set_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(KID_A, K_A)])))
        .expect(1)
        .mount(&server)
        .await;

    let config = AuthenticatorConfig::new(
        Some(ISSUER.to_string()),
        KeySource::JwksUri(format!("{}/jwks.json", server.uri())),
    )
    .with_allowed_clients([CLIENT_ID])
    .with_algorithms(vec![Algorithm::HS256]);
    let auth = authenticator(config);

    for _ in 0..3 {
        auth.authenticate(&access_token("orders:read")).await.unwrap();
    }
}

#[tokio::test]
async fn unknown_kid_triggers_a_key_set_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(KID_A, K_A)])))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwks.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(jwks_json(&[(KID_A, K_A), (KID_B, K_B)])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = AuthenticatorConfig::new(
        Some(ISSUER.to_string()),
        KeySource::JwksUri(format!("{}/jwks.json", server.uri())),
    )
    .with_allowed_clients([CLIENT_ID])
    .with_algorithms(vec![Algorithm::HS256])
    .with_min_refetch_interval(Duration::ZERO);
    let auth = authenticator(config);

    auth.authenticate(&access_token("orders:read")).await.unwrap();
    let rotated = sign(KID_B, SECRET_B, &m2m_claims("orders:read", 3600));
    auth.authenticate(&rotated).await.unwrap();
    // Both keys are now cached.
    auth.authenticate(&rotated).await.unwrap();
    auth.authenticate(&access_token("orders:read")).await.unwrap();
}

#[tokio::test]
async fn unknown_kids_do_not_refetch_a_recently_fetched_key_set() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(KID_A, K_A)])))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwks.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(jwks_json(&[(KID_A, K_A), (KID_B, K_B)])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = AuthenticatorConfig::new(
        Some(ISSUER.to_string()),
        KeySource::JwksUri(format!("{}/jwks.json", server.uri())),
    )
    .with_allowed_clients([CLIENT_ID])
    .with_algorithms(vec![Algorithm::HS256])
    .with_min_refetch_interval(Duration::from_millis(300));
    let auth = authenticator(config);

    auth.authenticate(&access_token("orders:read")).await.unwrap();
    for i in 0..20 {
        let forged = sign(&format!("kid-{i}"), SECRET_A, &m2m_claims("orders:read", 3600));
        let err = auth.authenticate(&forged).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");
    }
    let rotated = sign(KID_B, SECRET_B, &m2m_claims("orders:read", 3600));
    assert!(matches!(
        auth.authenticate(&rotated).await.unwrap_err(),
        AuthError::InvalidToken(_)
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    auth.authenticate(&rotated).await.unwrap();
}

#[tokio::test]
async fn issuer_and_keys_come_from_discovery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pool-1/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": ISSUER,
            "jwks_uri": format!("{}/pool-1/.well-known/jwks.json", server.uri()),
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pool-1/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(KID_A, K_A)])))
        .mount(&server)
        .await;

    let config = AuthenticatorConfig::new(
        None,
        KeySource::Discovery(format!("{}/pool-1/.well-known/openid-configuration", server.uri())),
    )
    .with_allowed_clients([CLIENT_ID])
    .with_algorithms(vec![Algorithm::HS256]);
    let auth = authenticator(config);

    let claims = auth.authenticate(&access_token("orders:read")).await.unwrap();
    assert_eq!(claims.issuer, ISSUER);
    auth.authenticate(&access_token("orders:read")).await.unwrap();
}

#[tokio::test]
async fn key_set_outage_is_not_an_invalid_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = AuthenticatorConfig::new(
        Some(ISSUER.to_string()),
        KeySource::JwksUri(format!("{}/jwks.json", server.uri())),
    )
    .with_allowed_clients([CLIENT_ID])
    .with_algorithms(vec![Algorithm::HS256]);
    let auth = authenticator(config);

    let err = auth.authenticate(&access_token("orders:read")).await.unwrap_err();
    assert!(matches!(err, AuthError::KeySetUnavailable(_)), "{err:?}");
    assert!(!err.is_unauthorized());
}

#[tokio::test]
async fn slow_key_set_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(jwks_json(&[(KID_A, K_A)]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let config = AuthenticatorConfig::new(
        Some(ISSUER.to_string()),
        KeySource::JwksUri(format!("{}/jwks.json", server.uri())),
    )
    .with_allowed_clients([CLIENT_ID])
    .with_algorithms(vec![Algorithm::HS256])
    .with_fetch_timeout(Duration::from_millis(100));
    let auth = authenticator(config);

    let err = auth.authenticate(&access_token("orders:read")).await.unwrap_err();
    assert!(matches!(&err, AuthError::KeySetUnavailable(msg) if msg.contains("timed out")), "{err:?}");
}
