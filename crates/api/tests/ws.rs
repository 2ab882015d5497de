//! Live job event streams over real WebSocket connections.

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use opsdeck_core::job::{JobStatus, JobUpdate, NewJob};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{spawn_server, spawn_server_with, test_config, TestServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn create_job(server: &TestServer, job_id: &str) {
    server
        .tracker()
        .create(NewJob {
            job_id: Some(job_id.to_string()),
            name: "site.yml".to_string(),
            owner_id: Some("alice".to_string()),
            target_descriptor: serde_json::json!({"playbook": "site.yml", "hosts": ["web1"]}),
        })
        .await
        .expect("create job");
}

async fn connect(server: &TestServer, job_id: &str) -> Client {
    let url = format!("{}?owner_id=alice", server.ws_url(job_id));
    let (client, _) = connect_async(url).await.expect("connect");
    client
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no message in time")
            .expect("stream ended")
            .expect("receive");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Test: unknown jobs are rejected before the upgrade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_is_rejected_with_404() {
    let server = spawn_server().await;

    let result = connect_async(server.ws_url("does-not-exist")).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
    assert_eq!(server.gateway().connection_count().await, 0);
}

// ---------------------------------------------------------------------------
// Test: acknowledgement, then backlog, then live events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_sends_ack_then_backlog() {
    let server = spawn_server().await;
    create_job(&server, "j-backlog").await;
    for line in ["one", "two", "three"] {
        server
            .tracker()
            .append_log("j-backlog", line)
            .await
            .expect("append");
    }

    let mut client = connect(&server, "j-backlog").await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "connected");
    assert_eq!(ack["job_id"], "j-backlog");
    assert!(ack["timestamp"].is_string());

    for expected in ["one", "two", "three"] {
        let event = next_json(&mut client).await;
        assert_eq!(event["type"], "log");
        assert!(event["data"]["message"]
            .as_str()
            .expect("message")
            .ends_with(expected));
    }

    server
        .tracker()
        .append_log("j-backlog", "four")
        .await
        .expect("append");
    let live = next_json(&mut client).await;
    assert!(live["data"]["message"].as_str().expect("message").ends_with("four"));
}

#[tokio::test]
async fn backlog_is_limited_to_recent_lines() {
    let mut config = test_config();
    config.ws_backlog_lines = 2;
    let server = spawn_server_with(config).await;
    create_job(&server, "j-limit").await;
    for line in ["a", "b", "c"] {
        server.tracker().append_log("j-limit", line).await.expect("append");
    }

    let mut client = connect(&server, "j-limit").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    let first = next_json(&mut client).await;
    let second = next_json(&mut client).await;
    assert!(first["data"]["message"].as_str().unwrap().ends_with("b"));
    assert!(second["data"]["message"].as_str().unwrap().ends_with("c"));
}

// ---------------------------------------------------------------------------
// Test: application-level ping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = spawn_server().await;
    create_job(&server, "j-ping").await;

    let mut client = connect(&server, "j-ping").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    client
        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .expect("send");
    let pong = next_json(&mut client).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_string());

    client.send(Message::Text("ping".to_string())).await.expect("send");
    assert_eq!(next_json(&mut client).await["type"], "pong");
}

// ---------------------------------------------------------------------------
// Test: two viewers see the same sequence; a late reader sees the end state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn viewers_receive_identical_sequences() {
    let server = spawn_server().await;
    create_job(&server, "j3").await;

    let mut first = connect(&server, "j3").await;
    let mut second = connect(&server, "j3").await;
    assert_eq!(next_json(&mut first).await["type"], "connected");
    assert_eq!(next_json(&mut second).await["type"], "connected");
    assert_eq!(server.gateway().connections_for("j3").await, 2);

    let tracker = server.tracker();
    tracker
        .update("j3", &JobUpdate::status(JobStatus::Started).with_progress(0))
        .await
        .expect("start");
    tracker.append_log("j3", "PLAY [all]").await.expect("log");
    tracker.append_log("j3", "ok: [web1]").await.expect("log");
    tracker
        .update(
            "j3",
            &JobUpdate::status(JobStatus::Success).with_progress(100),
        )
        .await
        .expect("finish");

    let mut seen_first = Vec::new();
    let mut seen_second = Vec::new();
    for _ in 0..4 {
        seen_first.push(next_json(&mut first).await);
        seen_second.push(next_json(&mut second).await);
    }
    assert_eq!(seen_first, seen_second);

    let types: Vec<&str> = seen_first
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["status", "log", "log", "status"]);
    assert_eq!(seen_first[3]["data"]["status"], "SUCCESS");

    // A viewer arriving after the end reads the final state from the record.
    let job = tracker.get("j3").await.expect("get").expect("job");
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.progress, 100);
}

// ---------------------------------------------------------------------------
// Test: disconnects and idle connections are cleaned up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closing_client_is_deregistered() {
    let server = spawn_server().await;
    create_job(&server, "j-close").await;

    let mut client = connect(&server, "j-close").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");
    assert_eq!(server.gateway().connection_count().await, 1);

    client.close(None).await.expect("close");

    let gateway = server.gateway().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection not removed");
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let mut config = test_config();
    config.ws_heartbeat_timeout_secs = 1;
    let server = spawn_server_with(config).await;
    create_job(&server, "j-idle").await;

    let mut client = connect(&server, "j-idle").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = client.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close the idle connection");

    let gateway = server.gateway().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle connection not removed");
}
