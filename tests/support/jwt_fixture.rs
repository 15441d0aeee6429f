//! Test fixtures: HS256 signing keys published as `oct` JWKs, token minting,
//! and canned token endpoint responses.
#![allow(dead_code)]

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

pub const ISSUER: &str = "https://idp.example.test/pool-1";
pub const CLIENT_ID: &str = "m2m-client";
pub const CLIENT_SECRET: &str = "s3cr3t-value";

pub const KID_A: &str = "key-a";
pub const SECRET_A: &[u8] = b"toolgate-integration-signing-key!";
/// base64url of `SECRET_A`
pub const K_A: &str = "dG9vbGdhdGUtaW50ZWdyYXRpb24tc2lnbmluZy1rZXkh";

pub const KID_B: &str = "key-b";
pub const SECRET_B: &[u8] = b"rotated-integration-signing-key!!";
/// base64url of `SECRET_B`
pub const K_B: &str = "cm90YXRlZC1pbnRlZ3JhdGlvbi1zaWduaW5nLWtleSEh";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// JWKS document containing the given `(kid, k)` pairs.
pub fn jwks_json(keys: &[(&str, &str)]) -> Value {
    let keys: Vec<Value> = keys
        .iter()
        .map(|(kid, k)| json!({ "kty": "oct", "kid": kid, "alg": "HS256", "k": k }))
        .collect();
    json!({ "keys": keys })
}

pub fn jwks(keys: &[(&str, &str)]) -> JwkSet {
    serde_json::from_value(jwks_json(keys)).expect("valid jwks")
}

/// Claims as issued by the identity provider for a client-credentials grant.
pub fn m2m_claims(scope: &str, expires_in: i64) -> Value {
    json!({
        "sub": CLIENT_ID,
        "iss": ISSUER,
        "client_id": CLIENT_ID,
        "token_use": "access",
        "scope": scope,
        "iat": now(),
        "exp": now() + expires_in,
    })
}

pub fn sign_with(alg: Algorithm, kid: &str, secret: &[u8], claims: &Value) -> String {
    let mut header = Header::new(alg);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).expect("token signs")
}

pub fn sign(kid: &str, secret: &[u8], claims: &Value) -> String {
    sign_with(Algorithm::HS256, kid, secret, claims)
}

/// A signed access token for `scope`, valid for an hour.
pub fn access_token(scope: &str) -> String {
    sign(KID_A, SECRET_A, &m2m_claims(scope, 3600))
}

/// Token endpoint success body.
pub fn token_response(access_token: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access_token,
        "expires_in": expires_in,
        "token_type": "Bearer",
    })
}
