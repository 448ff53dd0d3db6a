//! Config subscriber integration tests

use std::sync::Arc;
use std::time::Duration;

use citadel_agent::backoff::BackoffPolicy;
use citadel_agent::subscriber::ConfigSubscriber;
use citadel_agent::{Error, NodeId};
use serde_json::json;
use tokio_util::sync::CancellationToken;

mod common;
use common::{RecordingApplier, ScriptedConnector, Session, eventually};

fn message(node_id: &str, config: serde_json::Value) -> String {
    json!({
        "type": "config_updated",
        "nodeId": node_id,
        "config": config,
        "updatedAt": "2026-03-01T12:00:00Z",
    })
    .to_string()
}

fn subscriber(
    connector: Arc<ScriptedConnector>,
    applier: Arc<RecordingApplier>,
) -> ConfigSubscriber {
    ConfigSubscriber::new(connector, applier, NodeId::new("gpu-1").unwrap())
}

#[tokio::test]
async fn applies_valid_update() {
    let applier = RecordingApplier::new();
    let sub = subscriber(ScriptedConnector::new(vec![]), applier.clone());

    sub.handle_message(&message(
        "gpu-1",
        json!({"deviceName": "rig", "services": ["vllm"], "visibleToTeam": true}),
    ))
    .await
    .unwrap();

    let applied = applier.applied().await;
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].device_name, "rig");
    assert_eq!(applied[0].services, vec!["vllm"]);
    assert!(applied[0].visible_to_team);
}

#[tokio::test]
async fn rejects_wrong_type_and_foreign_node() {
    let applier = RecordingApplier::new();
    let sub = subscriber(ScriptedConnector::new(vec![]), applier.clone());

    let wrong_type = json!({"type": "config_deleted", "nodeId": "gpu-1", "config": {}});
    let err = sub.handle_message(&wrong_type.to_string()).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let err = sub
        .handle_message(&message("gpu-2", json!({"deviceName": "rig"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let err = sub.handle_message("{\"type\":").await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    assert!(applier.applied().await.is_empty());
}

#[tokio::test]
async fn rejects_over_limit_update_whole() {
    let applier = RecordingApplier::new();
    let sub = subscriber(ScriptedConnector::new(vec![]), applier.clone());

    let services: Vec<String> = (0..51).map(|i| format!("svc-{i}")).collect();
    let err = sub
        .handle_message(&message(
            "gpu-1",
            json!({"deviceName": "rig", "services": services}),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(applier.applied().await.is_empty());
}

#[tokio::test]
async fn apply_failure_is_reported() {
    let applier = RecordingApplier::new();
    applier.fail.store(1, std::sync::atomic::Ordering::SeqCst);
    let sub = subscriber(ScriptedConnector::new(vec![]), applier.clone());

    let err = sub
        .handle_message(&message("gpu-1", json!({"deviceName": "rig"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Manifest(_)));
}

#[test]
fn listens_on_node_channel() {
    let sub = subscriber(ScriptedConnector::new(vec![]), RecordingApplier::new());
    assert_eq!(sub.channel(), "config:node:gpu-1");
}

#[tokio::test(start_paused = true)]
async fn reconnects_and_keeps_applying_after_failures() {
    let connector = ScriptedConnector::new(vec![
        Session::Refuse,
        Session::Deliver(vec![
            Ok("not json".to_string()),
            Ok(message("gpu-1", json!({"deviceName": "after-reconnect"}))),
            Err(Error::Broker("connection reset".to_string())),
        ]),
        Session::Deliver(vec![Ok(message(
            "gpu-1",
            json!({"deviceName": "second-session"}),
        ))]),
    ]);
    let applier = RecordingApplier::new();
    let sub = Arc::new(
        subscriber(connector.clone(), applier.clone())
            .with_backoff(BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(4))),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let sub = sub.clone();
        let cancel = cancel.clone();
        async move { sub.run(cancel).await }
    });

    // refused, then a session ending in an error, then one closed by the peer
    eventually(|| {
        let connector = connector.clone();
        async move { connector.subscribe_count() >= 4 }
    })
    .await;

    let names: Vec<String> = applier
        .applied()
        .await
        .into_iter()
        .map(|u| u.device_name)
        .collect();
    assert_eq!(names, vec!["after-reconnect", "second-session"]);

    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_reconnect_wait() {
    let connector = ScriptedConnector::new(vec![Session::Refuse]);
    let sub = subscriber(connector.clone(), RecordingApplier::new());
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });

    // the default policy would wait a full second before retrying
    let result = sub.run(cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(connector.subscribe_count(), 1);
}
