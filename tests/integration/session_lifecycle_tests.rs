//! Provider and session lifecycle against the in-memory engine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use berth::engine::{Engine, ExposedPort, ResourceKind};
use berth::logs::StreamKind;
use berth::reaper::{group_labels, LABEL_MANAGED_BY, LABEL_SESSION_GROUP, MANAGED_BY_VALUE};
use berth::wait::{ForFunc, LogStrategy};
use berth::{AppError, NetworkSpec, Provider, SessionSpec, SessionState};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{test_config, MemoryEngine};

fn reaperless_config() -> berth::config::BerthConfig {
    let mut config = test_config();
    config.reaper.disabled = true;
    config
}

#[tokio::test]
async fn create_start_stop_terminate() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let cancel = CancellationToken::new();

    let mut session = provider
        .create_session(SessionSpec::new("nginx:alpine").with_exposed_port(ExposedPort::tcp(80)))
        .await
        .expect("create");
    assert_eq!(session.state(), SessionState::Created);
    assert!(!engine.is_running(session.id()));

    session.start(&cancel).await.expect("start");
    assert_eq!(session.state(), SessionState::Running);
    assert!(engine.is_running(session.id()));

    session.stop(&cancel, None).await.expect("stop");
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!engine.is_running(session.id()));

    session.start(&cancel).await.expect("restart");
    assert_eq!(session.state(), SessionState::Running);

    let id = session.id().clone();
    session.terminate(&cancel).await.expect("terminate");
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(!engine.exists(&id));
}

#[tokio::test]
async fn terminated_session_rejects_every_operation() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let cancel = CancellationToken::new();

    let mut session = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    session.terminate(&cancel).await.expect("terminate");

    assert!(matches!(
        session.start(&cancel).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        session.stop(&cancel, None).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        session.terminate(&cancel).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(session.host(), Err(AppError::InvalidState(_))));
    assert!(matches!(
        session.mapped_port(ExposedPort::tcp(6379)).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        session.start_log_producer(&cancel),
        Err(AppError::InvalidState(_))
    ));
}

#[tokio::test]
async fn terminate_tolerates_a_resource_removed_elsewhere() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let cancel = CancellationToken::new();

    let mut session = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    engine
        .remove(session.id(), Default::default())
        .await
        .expect("out-of-band remove");

    session.terminate(&cancel).await.expect("terminate");
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn transient_pull_failures_are_retried() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    engine.fail_next("pull", AppError::Engine("registry timed out".into()));
    engine.fail_next("pull", AppError::Engine("registry timed out".into()));

    let session = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create after retries");

    assert_eq!(engine.pulls(), vec!["redis:7"; 3]);
    assert!(engine.exists(session.id()));
}

#[tokio::test]
async fn missing_image_fails_without_retry_or_resource() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    engine.fail_next("pull", AppError::NotFound("manifest unknown".into()));

    let err = provider
        .create_session(SessionSpec::new("nope:latest"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)), "got {err}");
    assert!(err.to_string().contains("pull nope:latest"), "got {err}");
    assert_eq!(engine.pulls().len(), 1);
    assert!(engine
        .matching(ResourceKind::Container, &Default::default())
        .is_empty());
}

#[tokio::test]
async fn skip_reaper_applies_only_the_management_label() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), test_config());

    let session = provider
        .create_session(
            SessionSpec::new("redis:7")
                .with_label("team", "storage")
                .with_skip_reaper(),
        )
        .await
        .expect("create");

    let labels = engine.labels_of(session.id());
    assert_eq!(labels["team"], "storage");
    assert_eq!(labels[LABEL_MANAGED_BY], MANAGED_BY_VALUE);
    assert!(!labels.contains_key(LABEL_SESSION_GROUP));
    assert_eq!(session.session_group(), None);
    assert!(engine.reapers().is_empty(), "no reaper should be provisioned");
}

#[tokio::test]
async fn reaped_sessions_carry_group_labels_without_overriding_caller_keys() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), test_config());

    let session = provider
        .create_session(
            SessionSpec::new("postgres:16")
                .with_label("team", "storage")
                .with_label(LABEL_MANAGED_BY, "someone-else"),
        )
        .await
        .expect("create");

    let labels = engine.labels_of(session.id());
    assert_eq!(labels["team"], "storage");
    assert_eq!(labels[LABEL_MANAGED_BY], "someone-else");
    assert_eq!(
        labels[LABEL_SESSION_GROUP],
        provider.session_group().to_string()
    );
    assert_eq!(engine.reapers().len(), 1);
    assert_eq!(session.session_group(), Some(provider.session_group()));

    provider.registry().disconnect_all().await;
}

#[tokio::test]
async fn endpoints_use_the_published_port() {
    let engine = MemoryEngine::new();
    engine.map_port(ExposedPort::tcp(5432), 40_001);
    let provider = Provider::new(engine.clone(), reaperless_config());

    let session = provider
        .create_session(
            SessionSpec::new("postgres:16")
                .with_exposed_port(ExposedPort::tcp(8080))
                .with_exposed_port(ExposedPort::tcp(5432)),
        )
        .await
        .expect("create");

    assert_eq!(session.host().unwrap(), "127.0.0.1");
    assert_eq!(
        session.mapped_port(ExposedPort::tcp(5432)).await.unwrap(),
        40_001
    );
    assert_eq!(
        session.endpoint(Some("postgres")).await.unwrap(),
        "postgres://127.0.0.1:40001"
    );
    assert!(matches!(
        session.mapped_port(ExposedPort::udp(5432)).await,
        Err(AppError::Engine(_))
    ));
}

#[tokio::test]
async fn host_override_from_config_wins() {
    let engine = MemoryEngine::new();
    let mut config = reaperless_config();
    config.host = Some("docker.internal".into());
    let provider = Provider::new(engine.clone(), config);

    let session = provider
        .create_session(SessionSpec::new("redis:7").with_exposed_port(ExposedPort::tcp(6379)))
        .await
        .expect("create");

    let endpoint = session
        .port_endpoint(ExposedPort::tcp(6379), None)
        .await
        .unwrap();
    assert!(endpoint.starts_with("docker.internal:"));
}

#[tokio::test]
async fn endpoint_without_exposed_ports_is_invalid() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let session = provider
        .create_session(SessionSpec::new("busybox"))
        .await
        .expect("create");

    assert!(matches!(
        session.endpoint(None).await,
        Err(AppError::InvalidState(_))
    ));
}

#[tokio::test]
async fn start_blocks_on_the_log_wait_strategy() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let cancel = CancellationToken::new();

    let mut session = provider
        .create_session(
            SessionSpec::new("postgres:16").waiting_for(
                LogStrategy::new("ready to accept connections")
                    .with_occurrence(2)
                    .with_poll_interval(Duration::from_millis(20))
                    .with_startup_timeout(Duration::from_secs(5)),
            ),
        )
        .await
        .expect("create");

    let id = session.id().clone();
    let emitter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.emit(&id, StreamKind::Stderr, "ready to accept connections\n");
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.emit(&id, StreamKind::Stderr, "restarting\n");
            engine.emit(&id, StreamKind::Stderr, "ready to accept connections\n");
        })
    };

    session.start(&cancel).await.expect("ready");
    emitter.await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn failed_readiness_leaves_the_session_created() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let mut session = provider
        .create_session(
            SessionSpec::new("app:latest").waiting_for(
                ForFunc::new(move |_target| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(false) })
                })
                .with_poll_interval(Duration::from_millis(10))
                .with_startup_timeout(Duration::from_millis(100)),
            ),
        )
        .await
        .expect("create");

    let err = session.start(&cancel).await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "got {err}");
    assert_eq!(session.state(), SessionState::Created);
    assert!(engine.is_running(session.id()), "left running for inspection");
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn cancelled_start_reports_cancellation() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), reaperless_config());
    let cancel = CancellationToken::new();

    let mut session = provider
        .create_session(
            SessionSpec::new("app:latest")
                .waiting_for(LogStrategy::new("never printed").with_poll_interval(Duration::from_millis(10))),
        )
        .await
        .expect("create");

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = session.start(&cancel).await.unwrap_err();
    assert!(matches!(err, AppError::Cancelled(_)), "got {err}");
}

#[tokio::test]
async fn networks_are_labeled_and_removed_once() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), test_config());
    let cancel = CancellationToken::new();

    let mut network = provider
        .create_network(NetworkSpec::new("backend").with_label("tier", "db"))
        .await
        .expect("create network");
    assert_eq!(network.name(), "backend");
    assert_eq!(network.id().kind, ResourceKind::Network);

    let filter = group_labels(provider.session_group());
    assert_eq!(
        engine.matching(ResourceKind::Network, &filter),
        vec![network.id().clone()]
    );
    assert_eq!(engine.labels_of(network.id())["tier"], "db");

    network.remove(&cancel).await.expect("remove");
    assert!(engine.matching(ResourceKind::Network, &filter).is_empty());
    assert!(matches!(
        network.remove(&cancel).await,
        Err(AppError::InvalidState(_))
    ));

    provider.registry().disconnect_all().await;
}
