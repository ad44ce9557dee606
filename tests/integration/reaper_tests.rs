//! Reaper server sweeps and the provider's reaper registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use berth::engine::{Labels, ResourceId, ResourceKind};
use berth::reaper::protocol::encode_line;
use berth::reaper::{
    group_labels, ControlRequest, ControlResponse, ReaperRegistry, ReaperServer, ReaperSettings,
    SweepReport,
};
use berth::{AppError, NetworkSpec, Provider, SessionSpec, SessionState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::test_helpers::{eventually, test_config, test_reaper_settings, MemoryEngine};

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningReaper {
    addr: SocketAddr,
    reports: mpsc::Receiver<SweepReport>,
    cancel: CancellationToken,
    task: JoinHandle<berth::Result<()>>,
}

async fn spawn_reaper(engine: &Arc<MemoryEngine>, settings: ReaperSettings) -> RunningReaper {
    let (tx, reports) = mpsc::channel(16);
    let server = ReaperServer::bind("127.0.0.1:0", engine.clone(), settings)
        .await
        .expect("bind")
        .with_report_channel(tx);
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.serve(cancel.clone()));
    RunningReaper {
        addr,
        reports,
        cancel,
        task,
    }
}

struct ControlClient {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) -> ControlResponse {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let reply = self.lines.next_line().await.unwrap().expect("response line");
        serde_json::from_str(&reply).unwrap()
    }

    async fn send(&mut self, request: &ControlRequest) -> ControlResponse {
        let line = encode_line(request).unwrap();
        self.send_raw(&line).await
    }

    async fn watch(&mut self, labels: Labels) {
        let response = self.send(&ControlRequest::Watch { labels }).await;
        assert!(response.ok, "watch rejected: {:?}", response.error);
    }
}

async fn next_report(reaper: &mut RunningReaper) -> SweepReport {
    tokio::time::timeout(REPORT_TIMEOUT, reaper.reports.recv())
        .await
        .expect("sweep within timeout")
        .expect("report channel open")
}

fn seed_group(engine: &MemoryEngine, group: Uuid) -> (ResourceId, ResourceId) {
    let labels = group_labels(group);
    (
        engine.seed(ResourceKind::Container, labels.clone()),
        engine.seed(ResourceKind::Network, labels),
    )
}

fn no_exit(mut settings: ReaperSettings) -> ReaperSettings {
    settings.exit_when_idle = false;
    settings
}

#[tokio::test]
async fn lost_connection_sweeps_only_its_group() {
    let engine = MemoryEngine::new();
    let mut reaper = spawn_reaper(&engine, no_exit(test_reaper_settings())).await;

    let (doomed, doomed_net) = seed_group(&engine, Uuid::new_v4());
    let doomed_group = engine.labels_of(&doomed);
    let (kept, kept_net) = seed_group(&engine, Uuid::new_v4());
    let kept_group = engine.labels_of(&kept);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(doomed_group.clone()).await;
    let mut other = ControlClient::connect(reaper.addr).await;
    other.watch(kept_group).await;

    drop(client);
    let report = next_report(&mut reaper).await;

    assert_eq!(report.filter, doomed_group);
    assert_eq!(report.containers, vec![doomed.clone()]);
    assert_eq!(report.networks, vec![doomed_net.clone()]);
    assert!(report.errors.is_empty());
    assert!(!engine.exists(&doomed));
    assert!(!engine.exists(&doomed_net));
    assert!(engine.exists(&kept));
    assert!(engine.exists(&kept_net));

    // Containers go before networks.
    let removed = engine.removed();
    assert_eq!(removed, vec![doomed, doomed_net]);

    reaper.cancel.cancel();
    reaper.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn released_resources_are_not_swept() {
    let engine = MemoryEngine::new();
    let mut reaper = spawn_reaper(&engine, no_exit(test_reaper_settings())).await;
    let group = Uuid::new_v4();
    let (container, network) = seed_group(&engine, group);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;
    let released = client
        .send(&ControlRequest::Release {
            id: container.clone(),
        })
        .await;
    assert!(released.ok);

    drop(client);
    let report = next_report(&mut reaper).await;

    assert!(report.containers.is_empty());
    assert_eq!(report.networks, vec![network]);
    assert!(engine.exists(&container));

    reaper.cancel.cancel();
}

#[tokio::test]
async fn a_release_only_covers_the_sweep_that_skips_it() {
    let engine = MemoryEngine::new();
    let mut reaper = spawn_reaper(&engine, no_exit(test_reaper_settings())).await;
    let group = Uuid::new_v4();
    let (container, network) = seed_group(&engine, group);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;
    let released = client
        .send(&ControlRequest::Release {
            id: container.clone(),
        })
        .await;
    assert!(released.ok);
    drop(client);

    let first = next_report(&mut reaper).await;
    assert!(first.containers.is_empty());
    assert_eq!(first.networks, vec![network]);
    assert!(engine.exists(&container));

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;
    drop(client);

    let second = next_report(&mut reaper).await;
    assert_eq!(second.containers, vec![container.clone()]);
    assert!(!engine.exists(&container));

    reaper.cancel.cancel();
}

#[tokio::test]
async fn shared_filter_is_swept_after_the_last_connection() {
    let engine = MemoryEngine::new();
    let mut reaper = spawn_reaper(&engine, no_exit(test_reaper_settings())).await;
    let group = Uuid::new_v4();
    let (container, _) = seed_group(&engine, group);

    let mut first = ControlClient::connect(reaper.addr).await;
    first.watch(group_labels(group)).await;
    let mut second = ControlClient::connect(reaper.addr).await;
    second.watch(group_labels(group)).await;

    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.exists(&container), "swept while still watched");
    assert!(reaper.reports.try_recv().is_err());

    drop(second);
    let report = next_report(&mut reaper).await;
    assert_eq!(report.containers, vec![container]);

    reaper.cancel.cancel();
}

#[tokio::test]
async fn silent_peer_is_treated_as_lost() {
    let engine = MemoryEngine::new();
    let settings = ReaperSettings {
        peer_timeout: Duration::from_millis(200),
        ..no_exit(test_reaper_settings())
    };
    let mut reaper = spawn_reaper(&engine, settings).await;
    let group = Uuid::new_v4();
    let (container, _) = seed_group(&engine, group);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;

    // Keep the socket open but say nothing.
    let report = next_report(&mut reaper).await;
    assert_eq!(report.containers, vec![container]);
    drop(client);

    reaper.cancel.cancel();
}

#[tokio::test]
async fn pings_keep_a_connection_alive() {
    let engine = MemoryEngine::new();
    let settings = ReaperSettings {
        peer_timeout: Duration::from_millis(300),
        ..no_exit(test_reaper_settings())
    };
    let reaper = spawn_reaper(&engine, settings).await;
    let group = Uuid::new_v4();
    let (container, _) = seed_group(&engine, group);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.send(&ControlRequest::Ping).await.ok);
    }

    assert!(engine.exists(&container));
    reaper.cancel.cancel();
}

#[tokio::test]
async fn reconnect_within_grace_cancels_the_sweep() {
    let engine = MemoryEngine::new();
    let settings = ReaperSettings {
        sweep_grace: Duration::from_millis(400),
        ..no_exit(test_reaper_settings())
    };
    let mut reaper = spawn_reaper(&engine, settings).await;
    let group = Uuid::new_v4();
    let (container, _) = seed_group(&engine, group);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;
    drop(client);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut again = ControlClient::connect(reaper.addr).await;
    again.watch(group_labels(group)).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(engine.exists(&container), "sweep should have been cancelled");
    assert!(reaper.reports.try_recv().is_err());

    drop(again);
    let report = next_report(&mut reaper).await;
    assert_eq!(report.containers, vec![container]);

    reaper.cancel.cancel();
}

#[tokio::test]
async fn invalid_requests_get_an_error_and_the_connection_survives() {
    let engine = MemoryEngine::new();
    let reaper = spawn_reaper(&engine, no_exit(test_reaper_settings())).await;

    let mut client = ControlClient::connect(reaper.addr).await;
    let bad = client.send_raw("{not json}\n").await;
    assert!(!bad.ok);
    assert!(bad.error.unwrap().starts_with("invalid request"));

    let empty = client
        .send(&ControlRequest::Watch {
            labels: Labels::new(),
        })
        .await;
    assert!(!empty.ok);

    assert!(client.send(&ControlRequest::Ping).await.ok);
    reaper.cancel.cancel();
}

#[tokio::test]
async fn idle_reaper_exits_after_its_last_sweep() {
    let engine = MemoryEngine::new();
    let mut reaper = spawn_reaper(&engine, test_reaper_settings()).await;
    let group = Uuid::new_v4();
    seed_group(&engine, group);

    let mut client = ControlClient::connect(reaper.addr).await;
    client.watch(group_labels(group)).await;
    drop(client);

    next_report(&mut reaper).await;
    tokio::time::timeout(REPORT_TIMEOUT, &mut reaper.task)
        .await
        .expect("reaper exits when idle")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn reaper_exits_when_nobody_connects() {
    let engine = MemoryEngine::new();
    let settings = ReaperSettings {
        initial_connect_timeout: Duration::from_millis(100),
        ..test_reaper_settings()
    };
    let reaper = spawn_reaper(&engine, settings).await;

    tokio::time::timeout(REPORT_TIMEOUT, reaper.task)
        .await
        .expect("reaper gives up")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn registry_provisions_one_reaper_per_group() {
    let engine = MemoryEngine::new();
    let config = test_config();
    let registry = Arc::new(ReaperRegistry::new(engine.clone(), &config));
    let group = Uuid::new_v4();

    let first = registry.connect(group).await.expect("first connect");
    let second = registry.connect(group).await.expect("second connect");

    assert_eq!(engine.reapers().len(), 1);
    assert_eq!(first.session_group(), group);
    assert_eq!(second.labels(), group_labels(group));
    assert!(first.is_connected());

    registry.disconnect_all().await;
}

#[tokio::test]
async fn concurrent_connects_share_one_reaper() {
    let engine = MemoryEngine::new();
    let config = test_config();
    let registry = Arc::new(ReaperRegistry::new(engine.clone(), &config));
    let group = Uuid::new_v4();

    let (a, b) = tokio::join!(registry.connect(group), registry.connect(group));
    a.expect("first");
    b.expect("second");
    assert_eq!(engine.reapers().len(), 1);

    registry.disconnect_all().await;
}

#[tokio::test]
async fn disconnect_sweeps_every_session_of_the_group() {
    let engine = MemoryEngine::new();
    let mut reports = engine.sweep_reports();
    let provider = Provider::new(engine.clone(), test_config());

    let first = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    let second = provider
        .create_session(SessionSpec::new("postgres:16"))
        .await
        .expect("create");
    let survivor = provider
        .create_session(SessionSpec::new("nginx").with_skip_reaper())
        .await
        .expect("create");
    assert_eq!(engine.reapers().len(), 1);

    provider.registry().disconnect_all().await;

    let report = tokio::time::timeout(REPORT_TIMEOUT, reports.recv())
        .await
        .expect("sweep")
        .expect("report");
    let mut expected = vec![first.id().clone(), second.id().clone()];
    expected.sort();
    let mut swept = report.containers.clone();
    swept.sort();
    assert_eq!(swept, expected);
    assert!(engine.exists(survivor.id()));

    assert!(
        eventually(REPORT_TIMEOUT, || engine.reapers().is_empty()).await,
        "idle reaper should remove itself"
    );
}

#[tokio::test]
async fn terminated_sessions_are_released_before_the_sweep() {
    let engine = MemoryEngine::new();
    let mut reports = engine.sweep_reports();
    let provider = Provider::new(engine.clone(), test_config());
    let cancel = CancellationToken::new();

    let mut gone = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    let left = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    gone.terminate(&cancel).await.expect("terminate");

    provider.registry().disconnect_all().await;
    let report = tokio::time::timeout(REPORT_TIMEOUT, reports.recv())
        .await
        .expect("sweep")
        .expect("report");

    assert_eq!(report.containers, vec![left.id().clone()]);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn reconnect_after_loss_provisions_again() {
    let engine = MemoryEngine::new();
    let config = test_config();
    let registry = ReaperRegistry::new(engine.clone(), &config);
    let group = Uuid::new_v4();

    let handle = registry.connect(group).await.expect("connect");
    handle.disconnect().await;
    handle.disconnect().await;
    assert!(!handle.is_connected());
    assert!(
        eventually(REPORT_TIMEOUT, || engine.reapers().is_empty()).await,
        "idle reaper should remove itself"
    );

    let fresh = registry.connect(group).await.expect("reconnect");
    assert!(fresh.is_connected());

    registry.disconnect_all().await;
}

#[tokio::test]
async fn failed_terminate_leaves_the_container_to_the_sweep() {
    let engine = MemoryEngine::new();
    let mut reports = engine.sweep_reports();
    let provider = Provider::new(engine.clone(), test_config());

    let mut session = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    let cancelled = CancellationToken::new();
    cancelled.cancel();

    let err = session.terminate(&cancelled).await.unwrap_err();
    assert!(matches!(err, AppError::Cancelled(_)), "got {err}");
    assert_ne!(session.state(), SessionState::Terminated);
    assert!(engine.exists(session.id()));

    // Any release would reach the reaper well within this window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    provider.registry().disconnect_all().await;

    let report = tokio::time::timeout(REPORT_TIMEOUT, reports.recv())
        .await
        .expect("sweep")
        .expect("report");
    assert_eq!(report.containers, vec![session.id().clone()]);
    assert!(!engine.exists(session.id()));
}

#[tokio::test]
async fn failed_network_removal_leaves_it_to_the_sweep() {
    let engine = MemoryEngine::new();
    let mut reports = engine.sweep_reports();
    let provider = Provider::new(engine.clone(), test_config());

    let mut network = provider
        .create_network(NetworkSpec::new("backend"))
        .await
        .expect("create network");
    engine.fail_next(
        "remove",
        AppError::InvalidState("network has active endpoints".into()),
    );

    let err = network
        .remove(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)), "got {err}");
    assert!(engine.exists(network.id()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    provider.registry().disconnect_all().await;

    let report = tokio::time::timeout(REPORT_TIMEOUT, reports.recv())
        .await
        .expect("sweep")
        .expect("report");
    assert_eq!(report.networks, vec![network.id().clone()]);
    assert!(!engine.exists(network.id()));
}

#[tokio::test]
async fn stopped_reaper_drops_its_connections_without_sweeping() {
    let engine = MemoryEngine::new();
    let provider = Provider::new(engine.clone(), test_config());

    let session = provider
        .create_session(SessionSpec::new("redis:7"))
        .await
        .expect("create");
    let handle = provider
        .registry()
        .connect(provider.session_group())
        .await
        .expect("connect");
    assert!(handle.is_connected());

    engine.shutdown();

    assert!(
        eventually(REPORT_TIMEOUT, || !handle.is_connected()).await,
        "control connection should close with the reaper"
    );
    assert!(engine.exists(session.id()), "a stopped reaper must not sweep");
    assert_eq!(engine.reapers().len(), 1, "a stopped reaper keeps its container");
}

#[tokio::test]
async fn reaper_image_is_pulled_before_it_starts() {
    let engine = MemoryEngine::new();
    let config = test_config();
    let registry = ReaperRegistry::new(engine.clone(), &config);

    registry.connect(Uuid::new_v4()).await.expect("connect");
    assert_eq!(engine.pulls(), vec![config.reaper.image.clone()]);

    registry.disconnect_all().await;
}

#[tokio::test]
async fn missing_reaper_image_fails_provisioning() {
    let engine = MemoryEngine::new();
    let config = test_config();
    let registry = ReaperRegistry::new(engine.clone(), &config);
    engine.fail_next("pull", AppError::NotFound("no such image".into()));

    let err = registry.connect(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::Reaper(_)), "got {err}");
    assert!(engine.reapers().is_empty());
}
