//! End-to-end runtime tests
//!
//! Drive `Runtime::run_app` with mock handlers and check run status,
//! outputs, trace and the credential/token boundaries.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use apprun::config::PlatformLimits;
use apprun::credential::{ConfigPlatformCredentials, Credential, CredentialSource, InMemoryVault, Secret};
use apprun::error::{ErrorKind, ManifestError, RuntimeError, TokenError, ToolError};
use apprun::handler::{HandlerRegistry, MockHandler, ToolHandler};
use apprun::manifest::RawManifest;
use apprun::runtime::{RunMode, RunRequest, RunStatus, Runtime, TraceStatus};
use apprun::token::TokenMinter;

fn manifest(value: Value) -> RawManifest {
    serde_json::from_value(value).unwrap()
}

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn blog_writer() -> RawManifest {
    manifest(json!({
        "id": "blog-writer",
        "name": "Blog writer",
        "version": "1.0.0",
        "inputs": { "topic": { "type": "string", "required": true } },
        "outputs": { "draft": "text", "final": "text" },
        "permissions": ["llm.complete"],
        "runtime": { "steps": [
            { "tool": "llm.complete", "args": { "prompt": "Draft a post about {{topic}}" }, "output": "draft" },
            { "tool": "llm.complete", "args": { "prompt": "Polish: {{draft}}" }, "output": "final" }
        ]},
        "demo": { "sampleInputs": { "topic": "ownership" } }
    }))
}

fn runtime(registry: HandlerRegistry, vault: InMemoryVault) -> Runtime {
    Runtime::new(
        registry,
        Arc::new(vault),
        Arc::new(ConfigPlatformCredentials::uniform(
            &["openai", "email", "image"],
            "sk-platform-key",
        )),
        PlatformLimits::default(),
    )
}

// ═══════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════

#[tokio::test]
async fn two_step_chain_completes() {
    let rt = runtime(
        HandlerRegistry::mock(),
        InMemoryVault::new().with_secret("u1", "openai", "sk-user-key"),
    );

    let run = rt
        .run_app(
            RunRequest::new(blog_writer(), RunMode::Use)
                .with_user("u1")
                .with_inputs(inputs(json!({"topic": "lifetimes"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.outputs()["draft"], "[mock] Draft a post about lifetimes");
    assert_eq!(
        run.outputs()["final"],
        "[mock] Polish: [mock] Draft a post about lifetimes"
    );
    assert_eq!(run.trace().len(), 2);
    assert!(run.trace().iter().all(|e| e.status == TraceStatus::Ok));
    assert!(run.trace().iter().all(|e| e.tokens_used.is_some()));
}

#[tokio::test]
async fn missing_user_credential_without_fallback_fails() {
    let chat = manifest(json!({
        "id": "chat",
        "name": "Chat",
        "permissions": ["openai.chat", "email.send"],
        "runtime": { "steps": [
            { "tool": "openai.chat", "args": { "prompt": "hi" }, "output": "reply" },
            { "tool": "email.send", "args": { "to": "a@example.com", "subject": "s", "body": "{{reply}}" } }
        ]}
    }));
    let rt = runtime(HandlerRegistry::mock(), InMemoryVault::new());

    let run = rt
        .run_app(RunRequest::new(chat, RunMode::Use).with_user("u1").with_fallback(false))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.outputs().is_empty());
    assert_eq!(run.trace()[0].error_kind, Some(ErrorKind::CredentialMissing));
    assert_eq!(run.trace()[1].status, TraceStatus::Skipped);
}

#[tokio::test]
async fn fallback_uses_platform_key_when_allowed() {
    let rt = runtime(HandlerRegistry::mock(), InMemoryVault::new());
    let run = rt
        .run_app(
            RunRequest::new(blog_writer(), RunMode::Use)
                .with_user("u1")
                .with_fallback(true)
                .with_inputs(inputs(json!({"topic": "traits"}))),
        )
        .await
        .unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
}

fn slow_second_step(delay_first: Option<Duration>) -> (HandlerRegistry, Arc<MockHandler>) {
    let mut fast = MockHandler::new("llm.complete").with_provider("openai");
    if let Some(delay) = delay_first {
        fast = fast.with_delay(delay);
    }
    let slow = Arc::new(
        MockHandler::new("openai.chat")
            .with_provider("openai")
            .with_delay(Duration::from_secs(60)),
    );
    let registry = HandlerRegistry::builder()
        .register(fast)
        .register_arc(slow.clone())
        .build();
    (registry, slow)
}

fn long_timeout_manifest() -> RawManifest {
    manifest(json!({
        "id": "slow",
        "name": "Slow",
        "permissions": ["llm.complete", "openai.chat"],
        "runtime": {
            "limits": { "timeoutMs": 120000 },
            "steps": [
                { "tool": "llm.complete", "args": { "prompt": "outline" }, "output": "outline" },
                { "tool": "openai.chat", "args": { "prompt": "{{outline}}" }, "output": "post" }
            ]
        }
    }))
}

#[tokio::test(start_paused = true)]
async fn try_mode_clamps_timeout_and_keeps_partial_output() {
    let (registry, slow) = slow_second_step(None);
    let rt = runtime(registry, InMemoryVault::new());

    let validated = rt.validate(&long_timeout_manifest()).unwrap();
    assert_eq!(rt.governor().timeout_ms(&validated, RunMode::Try), 10_000);
    assert_eq!(rt.governor().timeout_ms(&validated, RunMode::Use), 120_000);

    let started = Instant::now();
    let run = rt
        .run_app(RunRequest::new(long_timeout_manifest(), RunMode::Try))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Partial);
    assert_eq!(run.outputs()["outline"], "[mock] outline");
    assert!(run.outputs().get("post").is_none());
    assert_eq!(run.trace()[1].error_kind, Some(ErrorKind::ToolTimeout));
    assert_eq!(slow.call_count(), 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn try_mode_timeout_without_prior_output_fails() {
    let (registry, _slow) = slow_second_step(Some(Duration::from_secs(60)));
    let rt = runtime(registry, InMemoryVault::new());

    let run = rt
        .run_app(RunRequest::new(long_timeout_manifest(), RunMode::Try))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.outputs().is_empty());
    assert_eq!(run.trace()[0].error_kind, Some(ErrorKind::ToolTimeout));
    assert_eq!(run.trace()[1].status, TraceStatus::Skipped);
}

#[tokio::test]
async fn missing_reference_with_default_resolves() {
    let llm = Arc::new(MockHandler::new("llm.complete").with_provider("openai"));
    let registry = HandlerRegistry::builder().register_arc(llm.clone()).build();
    let rt = runtime(registry, InMemoryVault::new());

    let raw = manifest(json!({
        "id": "defaults",
        "name": "Defaults",
        "permissions": ["llm.complete"],
        "runtime": { "steps": [
            { "tool": "llm.complete", "args": { "prompt": "{{missingField||defaultValue}}" }, "output": "text" }
        ]}
    }));

    let run = rt
        .run_app(RunRequest::new(raw, RunMode::Try))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(llm.invocations()[0].args["prompt"], "defaultValue");
}

#[tokio::test]
async fn repeated_runs_share_nothing() {
    let llm = Arc::new(MockHandler::new("llm.complete").with_provider("openai"));
    let registry = HandlerRegistry::builder().register_arc(llm.clone()).build();
    let rt = runtime(registry, InMemoryVault::new());

    let request = || {
        RunRequest::new(blog_writer(), RunMode::Try).with_inputs(inputs(json!({"topic": "x"})))
    };
    let first = rt.run_app(request()).await.unwrap();
    let second = rt.run_app(request()).await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(first.trace().len(), 2);
    assert_eq!(second.trace().len(), 2);

    let calls = llm.invocations();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].run_id, first.id());
    assert_eq!(calls[2].run_id, second.id());
    assert_ne!(calls[0].token_id, calls[2].token_id);
}

// ═══════════════════════════════════════════
// BOUNDARIES
// ═══════════════════════════════════════════

#[tokio::test]
async fn token_for_one_capability_is_rejected_by_another() {
    let credential = Arc::new(Credential::new(
        None,
        "email",
        CredentialSource::Platform,
        Secret::new("sk-email"),
    ));
    let token = TokenMinter::new(Duration::from_secs(60)).mint(
        Uuid::new_v4(),
        "email.send",
        credential,
        Instant::now() + Duration::from_secs(60),
    );

    for capability in ["llm.complete", "openai.chat", "http.fetch", "image.transform"] {
        let handler = MockHandler::new(capability);
        let err = handler.invoke(&token, &Map::new()).await.unwrap_err();
        assert_eq!(
            err,
            ToolError::Token(TokenError::ScopeMismatch {
                expected: capability.to_string(),
                actual: "email.send".to_string(),
            })
        );
        assert_eq!(handler.call_count(), 0);
    }
}

#[tokio::test]
async fn secrets_never_reach_run_or_record() {
    let rt = runtime(
        HandlerRegistry::mock(),
        InMemoryVault::new().with_secret("u1", "openai", "sk-user-very-secret"),
    );
    let run = rt
        .run_app(
            RunRequest::new(blog_writer(), RunMode::Use)
                .with_user("u1")
                .with_inputs(inputs(json!({"topic": "privacy"}))),
        )
        .await
        .unwrap();

    let record = serde_json::to_string(&run.to_record()).unwrap();
    assert!(!record.contains("sk-user-very-secret"));
    assert!(!record.contains("sk-platform-key"));
    assert!(!format!("{:?}", run).contains("sk-user-very-secret"));
}

#[tokio::test]
async fn try_mode_without_inputs_uses_demo_sample() {
    let llm = Arc::new(MockHandler::new("llm.complete").with_provider("openai"));
    let registry = HandlerRegistry::builder().register_arc(llm.clone()).build();
    let rt = runtime(registry, InMemoryVault::new());

    let run = rt
        .run_app(RunRequest::new(blog_writer(), RunMode::Try))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.inputs()["topic"], "ownership");
    assert_eq!(llm.invocations()[0].args["prompt"], "Draft a post about ownership");
}

#[tokio::test]
async fn rejections_create_no_run() {
    let llm = Arc::new(MockHandler::new("llm.complete").with_provider("openai"));
    let registry = HandlerRegistry::builder().register_arc(llm.clone()).build();
    let rt = runtime(registry, InMemoryVault::new());

    // required input missing in use mode
    let err = rt
        .run_app(RunRequest::new(blog_writer(), RunMode::Use))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Manifest(ManifestError::MissingInput { ref name }) if name == "topic"
    ));

    // reference to a name that is never defined
    let bad = manifest(json!({
        "id": "bad",
        "name": "Bad",
        "permissions": ["llm.complete"],
        "runtime": { "steps": [
            { "tool": "llm.complete", "args": { "prompt": "{{nowhere}}" } }
        ]}
    }));
    let err = rt
        .run_app(RunRequest::new(bad, RunMode::Try))
        .await
        .unwrap_err();
    match err {
        RuntimeError::Manifest(e) => assert_eq!(e.kind(), "UnknownReferenceError"),
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn provider_failure_after_output_is_partial() {
    let llm = Arc::new(MockHandler::new("llm.complete").with_provider("openai"));
    llm.queue_text("first draft");
    llm.queue_error(ToolError::RateLimited);
    let registry = HandlerRegistry::builder().register_arc(llm.clone()).build();
    let rt = runtime(registry, InMemoryVault::new());

    let run = rt
        .run_app(
            RunRequest::new(blog_writer(), RunMode::Try)
                .with_inputs(inputs(json!({"topic": "x"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Partial);
    assert_eq!(run.outputs()["draft"], "first draft");
    assert_eq!(run.trace()[1].error_kind, Some(ErrorKind::RateLimited));
}

#[tokio::test]
async fn auth_failure_discards_prior_output() {
    let llm = Arc::new(MockHandler::new("llm.complete").with_provider("openai"));
    llm.queue_text("first draft");
    llm.queue_error(ToolError::AuthFailed);
    let registry = HandlerRegistry::builder().register_arc(llm.clone()).build();
    let rt = runtime(registry, InMemoryVault::new());

    let run = rt
        .run_app(
            RunRequest::new(blog_writer(), RunMode::Try)
                .with_inputs(inputs(json!({"topic": "x"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.outputs().is_empty());
    assert_eq!(run.trace()[1].error_kind, Some(ErrorKind::AuthFailed));
}

// ═══════════════════════════════════════════
// REMOTE ENGINE
// ═══════════════════════════════════════════

fn remote_app(server: &MockServer) -> RawManifest {
    manifest(json!({
        "id": "remote-writer",
        "name": "Remote writer",
        "inputs": { "topic": { "type": "string", "required": true } },
        "outputs": { "final": "text" },
        "permissions": ["llm.complete", "email.send"],
        "runtime": { "engine": "remote", "limits": { "timeoutMs": 5000 } },
        "run": { "url": format!("{}/run", server.uri()) }
    }))
}

/// Remote apps are served from 127.0.0.1 by wiremock
fn remote_runtime() -> Runtime {
    Runtime::new(
        HandlerRegistry::mock(),
        Arc::new(InMemoryVault::new()),
        Arc::new(ConfigPlatformCredentials::uniform(
            &["openai", "email"],
            "sk-platform-key",
        )),
        PlatformLimits {
            allow_private_hosts: true,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn remote_app_gets_one_bearer_per_permission() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputs": { "final": "remote post", "debug": "dropped" },
            "trace": [
                { "tool": "llm.complete", "tokens": 40, "latencyMs": 12, "status": "ok" },
                { "tool": "email.send", "latencyMs": 3, "status": "ok" }
            ]
        })))
        .mount(&server)
        .await;

    let run = remote_runtime()
        .run_app(
            RunRequest::new(remote_app(&server), RunMode::Try)
                .with_inputs(inputs(json!({"topic": "rust"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.outputs().len(), 1);
    assert_eq!(run.outputs()["final"], "remote post");
    assert_eq!(run.trace().len(), 2);
    assert_eq!(run.trace()[0].tokens_used, Some(40));

    let received: Vec<Request> = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let raw_body = String::from_utf8_lossy(&received[0].body).to_string();
    assert!(!raw_body.contains("sk-platform-key"));

    let body: Value = serde_json::from_str(&raw_body).unwrap();
    assert_eq!(body["inputs"]["topic"], "rust");
    let tokens = body["tokens"].as_object().unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens["llm.complete"]["scope"], "llm.complete");
    assert_eq!(tokens["email.send"]["scope"], "email.send");
    assert_ne!(tokens["llm.complete"]["token"], tokens["email.send"]["token"]);
}

#[tokio::test]
async fn remote_error_entry_with_outputs_is_partial() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputs": { "final": "x" },
            "trace": [{ "tool": "llm.complete", "latencyMs": 5, "status": "error" }]
        })))
        .mount(&server)
        .await;

    let run = remote_runtime()
        .run_app(
            RunRequest::new(remote_app(&server), RunMode::Try)
                .with_inputs(inputs(json!({"topic": "rust"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Partial);
    assert_eq!(run.outputs()["final"], "x");
    assert_eq!(run.trace()[0].status, TraceStatus::Error);
    assert_eq!(run.trace()[0].error_kind, Some(ErrorKind::Provider));
}

#[tokio::test]
async fn remote_error_entry_without_outputs_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputs": {},
            "trace": [{ "tool": "llm.complete", "latencyMs": 5, "status": "error" }]
        })))
        .mount(&server)
        .await;

    let run = remote_runtime()
        .run_app(
            RunRequest::new(remote_app(&server), RunMode::Try)
                .with_inputs(inputs(json!({"topic": "rust"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.outputs().is_empty());
}

#[tokio::test]
async fn remote_app_without_credential_is_never_called() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "outputs": {} })))
        .mount(&server)
        .await;

    let run = remote_runtime()
        .run_app(
            RunRequest::new(remote_app(&server), RunMode::Use)
                .with_user("u1")
                .with_inputs(inputs(json!({"topic": "rust"}))),
        )
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.trace()[0].error_kind, Some(ErrorKind::CredentialMissing));
    assert!(server.received_requests().await.unwrap().is_empty());
}
