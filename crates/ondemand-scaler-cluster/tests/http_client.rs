//! HTTP client against a mock cluster manager.

use std::time::Duration;

use futures::StreamExt;
use ondemand_scaler_cluster::{
    ClusterApi, ClusterError, ClusterEvent, HttpClusterClient, QueryOptions,
};
use ondemand_scaler_core::{NodeId, NodeStatus};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client(server: &MockServer) -> HttpClusterClient {
    HttpClusterClient::new(server.uri(), Some("secret".into())).unwrap()
}

#[tokio::test]
async fn stale_read_carries_token_and_meta() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/nodes"))
        .and(query_param("stale", ""))
        .and(header("X-Nomad-Token", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Nomad-Index", "812")
                .insert_header("X-Nomad-LastContact", "1500")
                .set_body_json(json!([
                    {"ID": "n1", "Name": "gpu-1", "Status": "ready", "Drain": false},
                    {"ID": "n2", "Name": "gpu-2", "Status": "ready", "Drain": true}
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (nodes, meta) = client(&server)
        .await
        .list_nodes(QueryOptions::stale())
        .await
        .unwrap();

    assert_eq!(meta.last_index, 812);
    assert_eq!(meta.last_contact, Duration::from_millis(1500));
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].status, NodeStatus::Draining);
}

#[tokio::test]
async fn job_read_is_namespaced_and_missing_job_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/job/shop/summary"))
        .and(query_param("namespace", "retail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "JobID": "shop",
            "Namespace": "retail",
            "Summary": {"web": {"Queued": 2, "Running": 1}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/job/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("job not found"))
        .mount(&server)
        .await;

    let client = client(&server).await;
    let (summary, _) = client
        .job_summary("retail", "shop", QueryOptions::consistent())
        .await
        .unwrap();
    assert_eq!(summary.task_groups["web"].queued, 2);

    let err = client
        .job("retail", "gone", QueryOptions::consistent())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn server_errors_are_retriable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/namespaces"))
        .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader\n"))
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .list_namespaces(QueryOptions::stale())
        .await
        .unwrap_err();

    match &err {
        ClusterError::Status { status, message, .. } => {
            assert_eq!(*status, 500);
            assert_eq!(message, "No cluster leader");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retriable());
}

#[tokio::test]
async fn drain_posts_drain_spec() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/node/n1/drain"))
        .and(body_json(json!({
            "DrainSpec": {"Deadline": 0, "IgnoreSystemJobs": false},
            "MarkEligible": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"EvalIDs": []})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .drain_node(&NodeId::new("n1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn event_stream_yields_batches_and_ends() {
    let server = MockServer::start().await;
    let body = [
        json!({}).to_string(),
        json!({"Index": 900, "Events": [{
            "Topic": "Allocation", "Type": "AllocationUpdated",
            "Payload": {"Allocation": {
                "ID": "a1", "Namespace": "default", "JobID": "shop", "TaskGroup": "web",
                "NodeID": "n1", "DesiredStatus": "run", "ClientStatus": "pending"
            }}
        }]})
        .to_string(),
    ]
    .join("\n")
        + "\n";

    Mock::given(method("GET"))
        .and(path("/v1/event/stream"))
        .and(query_param("index", "850"))
        .and(query_param("namespace", "*"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut events = client(&server).await.event_stream(850).await.unwrap();
    let batch = events.next().await.unwrap().unwrap();
    assert_eq!(batch.index, 900);
    match &batch.events[0] {
        ClusterEvent::Allocation(alloc) => assert_eq!(alloc.node_id, NodeId::new("n1")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(events.next().await.is_none());
}
