//! Orchestrator -> broker -> gateway -> dispatcher, wired in-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::Algorithm;
use secrecy::SecretString;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use toolgate::auth::{BrokerOptions, ClientAuthMethod};
use toolgate::config::ProviderSettings;
use toolgate::error::{AuthError, DispatchErrorKind, IdentityError, OrchestratorError};
use toolgate::gateway::{AuthenticatorConfig, Gateway, GatewayAuthenticator, KeySource};
use toolgate::identity::{IdentityContext, WorkloadIdentity};
use toolgate::orchestrator::{
    FinalAnswer, InProcessTransport, OrchestratorOptions, RuntimeOrchestrator, TaskRequest, ToolOutcome,
};
use toolgate::retry::RetryPolicy;
use toolgate::tools::{
    OrderStore, ToolDispatcher, ToolError, ToolHandler, ToolInvocationRequest, ToolRegistry,
    ToolSpec, register_order_tools,
};

#[path = "support/jwt_fixture.rs"]
mod support;

use support::*;

const WORKLOAD: &str = "test-user-123";
const TARGET: &str = "order-lambda-target";

/// Always slower than the dispatcher's backend budget.
struct SlowTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for SlowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("slow_report", "never answers in time", json!({"type": "object"}))
    }

    async fn invoke(&self, _arguments: Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!({}))
    }
}

struct Harness {
    orchestrator: RuntimeOrchestrator,
    identities: Arc<IdentityContext>,
    slow_calls: Arc<AtomicUsize>,
    _idp: MockServer,
}

async fn harness(issued_token: String) -> Harness {
    harness_with(issued_token, None).await
}

/// With `jwks_delay` set, the gateway fetches its keys from the mock IdP,
/// which answers after that delay.
async fn harness_with(issued_token: String, jwks_delay: Option<Duration>) -> Harness {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response(&issued_token, 3600)))
        .mount(&idp)
        .await;

    let auth_config = match jwks_delay {
        None => AuthenticatorConfig::new(
            Some(ISSUER.to_string()),
            KeySource::Static(jwks(&[(KID_A, K_A)])),
        ),
        Some(delay) => {
            Mock::given(method("GET"))
                .and(path("/jwks.json"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(jwks_json(&[(KID_A, K_A)]))
                        .set_delay(delay),
                )
                .mount(&idp)
                .await;
            AuthenticatorConfig::new(
                Some(ISSUER.to_string()),
                KeySource::JwksUri(format!("{}/jwks.json", idp.uri())),
            )
            .with_fetch_timeout(Duration::from_millis(50))
        }
    };

    let providers = HashMap::from([(
        "agentcore-identity-for-gateway".to_string(),
        ProviderSettings {
            client_id: CLIENT_ID.to_string(),
            client_secret: SecretString::from(CLIENT_SECRET.to_string()),
            token_endpoint: Some(format!("{}/oauth2/token", idp.uri())),
            discovery_url: None,
            auth_method: ClientAuthMethod::ClientSecretPost,
        },
    )]);
    let workloads = [WorkloadIdentity {
        workload_user_id: WORKLOAD.to_string(),
        provider: "agentcore-identity-for-gateway".to_string(),
        resource_scope: "orders:read".to_string(),
    }];
    let identities = Arc::new(
        IdentityContext::new(providers, workloads, reqwest::Client::new(), BrokerOptions::default())
            .unwrap(),
    );

    let slow_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    register_order_tools(&mut registry, Arc::new(OrderStore::with_sample_orders())).unwrap();
    registry
        .register(Arc::new(SlowTool {
            calls: Arc::clone(&slow_calls),
        }))
        .unwrap();

    let authenticator = GatewayAuthenticator::new(
        auth_config
            .with_allowed_clients([CLIENT_ID])
            .with_algorithms(vec![Algorithm::HS256]),
        reqwest::Client::new(),
    )
    .unwrap();
    let dispatcher = ToolDispatcher::new(registry).with_backend_timeout(Duration::from_millis(50));
    let gateway = Arc::new(Gateway::new(authenticator, dispatcher));

    let orchestrator = RuntimeOrchestrator::new(
        Arc::clone(&identities),
        Arc::new(InProcessTransport::new(gateway)),
    )
    .with_retry_policy(
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    );

    Harness {
        orchestrator,
        identities,
        slow_calls,
        _idp: idp,
    }
}

fn task(tool: &str, arguments: Value) -> TaskRequest {
    TaskRequest::new(WORKLOAD, "check my order")
        .with_tool_call(ToolInvocationRequest::new(format!("{TARGET}___{tool}"), arguments))
}

#[tokio::test]
async fn order_lookup_succeeds_and_reuses_the_token() {
    let h = harness(access_token("orders:read")).await;

    let answer = h.orchestrator.handle(task("get_order", json!({"order_id": "123"}))).await.unwrap();
    assert!(answer.all_succeeded(), "{}", answer.summary);
    let payload = answer.outcomes[0].result.payload().unwrap();
    assert_eq!(payload["order_id"], "123");
    assert_eq!(payload["status"], "processing");
    assert_eq!(answer.outcomes[0].attempts, 1);

    h.orchestrator.handle(task("get_order", json!({"order_id": "123"}))).await.unwrap();
    let broker = h.identities.resolve(WORKLOAD).unwrap();
    assert_eq!(broker.exchange_count(), 1);
}

#[tokio::test]
async fn missing_order_is_a_business_error_without_retries() {
    let h = harness(access_token("orders:read")).await;

    let answer = h.orchestrator.handle(task("get_order", json!({"order_id": "999"}))).await.unwrap();
    let outcome = &answer.outcomes[0];
    assert_eq!(outcome.result.failure_kind(), Some(DispatchErrorKind::BusinessError));
    assert_eq!(outcome.attempts, 1);
    assert!(answer.summary.contains("order not found"), "{}", answer.summary);
    assert!(!answer.all_succeeded());
}

#[tokio::test]
async fn unavailable_backend_is_retried_then_reported() {
    let h = harness(access_token("orders:read")).await;

    let answer = h.orchestrator.handle(task("slow_report", json!({}))).await.unwrap();
    let outcome = &answer.outcomes[0];
    assert_eq!(outcome.result.failure_kind(), Some(DispatchErrorKind::BackendUnavailable));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(h.slow_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn key_set_outage_is_retried_as_an_unavailable_backend() {
    let h = harness_with(access_token("orders:read"), Some(Duration::from_millis(500))).await;

    let answer = h.orchestrator.handle(task("get_order", json!({"order_id": "123"}))).await.unwrap();
    let outcome = &answer.outcomes[0];
    assert_eq!(outcome.result.failure_kind(), Some(DispatchErrorKind::BackendUnavailable));
    assert_eq!(outcome.attempts, 3);

    // The token itself was never rejected.
    let broker = h.identities.resolve(WORKLOAD).unwrap();
    assert_eq!(broker.exchange_count(), 1);
}

#[tokio::test]
async fn write_tool_is_forbidden_for_a_read_scope() {
    let h = harness(access_token("orders:read")).await;

    let answer = h
        .orchestrator
        .handle(task(
            "update_order",
            json!({"order_id": "123", "fields": {"status": "cancelled"}}),
        ))
        .await
        .unwrap();
    assert_eq!(answer.outcomes[0].result.failure_kind(), Some(DispatchErrorKind::Forbidden));
}

#[tokio::test]
async fn unknown_workload_fails_before_any_exchange() {
    let h = harness(access_token("orders:read")).await;

    let err = h
        .orchestrator
        .handle(TaskRequest::new("agent-nobody", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Identity(IdentityError::UnknownWorkload { ref workload_user_id })
            if workload_user_id == "agent-nobody"
    ));
    assert_eq!(h.identities.broker_count(), 0);
}

#[tokio::test]
async fn rejected_token_ends_the_task_and_is_discarded() {
    // Signed with a key the gateway does not trust.
    let forged = sign(KID_A, SECRET_B, &m2m_claims("orders:read", 3600));
    let h = harness(forged).await;

    let err = h
        .orchestrator
        .handle(task("get_order", json!({"order_id": "123"})))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Auth(AuthError::InvalidToken(_))), "{err:?}");

    h.orchestrator
        .handle(task("get_order", json!({"order_id": "123"})))
        .await
        .unwrap_err();
    let broker = h.identities.resolve(WORKLOAD).unwrap();
    assert_eq!(broker.exchange_count(), 2);
}

#[tokio::test]
async fn empty_plan_and_callbacks() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let finished = Arc::new(AtomicUsize::new(0));
    let h = harness(access_token("orders:read")).await;

    let seen_cb = Arc::clone(&seen);
    let finished_cb = Arc::clone(&finished);
    let orchestrator = h.orchestrator.with_options(OrchestratorOptions {
        on_outcome: Some(Arc::new(move |o: &ToolOutcome| {
            seen_cb.lock().unwrap().push(o.tool_name.clone());
        })),
        on_finish: Some(Arc::new(move |_: &FinalAnswer| {
            finished_cb.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    });

    let answer = orchestrator.handle(TaskRequest::new(WORKLOAD, "hello")).await.unwrap();
    assert!(answer.outcomes.is_empty());
    assert_eq!(answer.summary, "no tool calls were needed");

    orchestrator
        .handle(task("get_order", json!({"order_id": "123"})))
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![format!("{TARGET}___get_order")]);
    assert_eq!(finished.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn oversized_plans_are_refused() {
    let h = harness(access_token("orders:read")).await;
    let orchestrator = h.orchestrator.with_options(OrchestratorOptions {
        max_calls: 1,
        ..Default::default()
    });

    let task = task("get_order", json!({"order_id": "123"}))
        .with_tool_call(ToolInvocationRequest::new("get_order", json!({"order_id": "123"})));
    let err = orchestrator.handle(task).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Planning(_)));
}
