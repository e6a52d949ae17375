//! Integration test: start the gateway on a free port, check health over HTTP, then drive
//! command requests over WebSocket. The server task is left running when each test ends.

use futures_util::{SinkExt, StreamExt};
use lib::config::Config;
use lib::gateway;
use lib::supervisor::tree;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn start_gateway(allowed: &[&str]) -> (u16, tempfile::TempDir) {
    let port = free_port();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.http_listen_address = "127.0.0.1".to_string();
    config.http_listen_port = port;
    config.allowed_commands = allowed.iter().map(|s| s.to_string()).collect();
    config.screenshot_dir = dir.path().join("shots");
    tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return (port, dir);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway on port {} did not come up within 5s", port);
}

async fn connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    ws
}

async fn send_request(ws: &mut Ws, data: Value) {
    let frame = json!({ "type": "commandRequest", "data": data });
    ws.send(Message::Text(frame.to_string())).await.expect("send");
}

/// Next `commandResponse` payload, within 10s.
async fn next_response(ws: &mut Ws) -> Value {
    let deadline = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            let Ok(Message::Text(text)) = msg else { continue };
            let frame: Value = serde_json::from_str(&text).expect("json frame");
            if frame["type"] == "commandResponse" {
                return frame["data"].clone();
            }
        }
        panic!("socket closed");
    });
    deadline.await.expect("response within 10s")
}

#[tokio::test]
async fn health_http_responds_with_running() {
    let (port, _dir) = start_gateway(&[]).await;
    let json: Value = reqwest::get(format!("http://127.0.0.1:{}/", port))
        .await
        .expect("GET /")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(json["runtime"], "running");
    assert_eq!(json["port"].as_u64(), Some(port as u64));
}

#[tokio::test]
async fn missing_screenshot_is_404() {
    let (port, _dir) = start_gateway(&[]).await;
    let resp = reqwest::get(format!("http://127.0.0.1:{}/webscreenshots/nothing.jpg", port))
        .await
        .expect("GET screenshot");
    assert_eq!(resp.status().as_u16(), 404);
}

#[cfg(unix)]
#[tokio::test]
async fn allowed_command_streams_output_then_completes() {
    let (port, _dir) = start_gateway(&["^echo"]).await;
    let mut ws = connect(port).await;
    send_request(&mut ws, json!({"type": "command", "id": "1", "cmd": "echo hi"})).await;

    assert_eq!(next_response(&mut ws).await, json!({"id": "1", "stream": "stdout", "data": "hi\n"}));
    assert_eq!(next_response(&mut ws).await, json!({"id": "1", "stream": "completed", "data": 0}));
}

#[tokio::test]
async fn rejected_command_reports_error() {
    let (port, _dir) = start_gateway(&["^echo"]).await;
    let mut ws = connect(port).await;
    send_request(&mut ws, json!({"type": "command", "id": "2", "cmd": "rm -rf /"})).await;

    let err = next_response(&mut ws).await;
    assert_eq!(err["stream"], "stderr");
    assert!(err["data"].as_str().unwrap().contains("not allowed"));
    assert_eq!(next_response(&mut ws).await, json!({"id": "2", "stream": "completed", "data": -1}));
}

#[tokio::test]
async fn malformed_request_completes_with_failure() {
    let (port, _dir) = start_gateway(&["^echo"]).await;
    let mut ws = connect(port).await;
    send_request(&mut ws, json!({"type": "performance", "id": "3", "target": "db", "port": "x", "runcount": 1})).await;

    let err = next_response(&mut ws).await;
    assert_eq!(err["stream"], "stderr");
    assert_eq!(next_response(&mut ws).await, json!({"id": "3", "stream": "completed", "data": -1}));
}

/// Start `echo $$; sleep 30` and return the shell's pid from its first output line.
#[cfg(unix)]
async fn start_sleeper(ws: &mut Ws, id: &str) -> u32 {
    send_request(ws, json!({"type": "command", "id": id, "cmd": "echo $$; sleep 30"})).await;
    let line = next_response(ws).await;
    assert_eq!(line["stream"], "stdout");
    line["data"].as_str().unwrap().trim().parse().expect("pid line")
}

#[cfg(unix)]
async fn wait_dead(pid: u32) -> bool {
    for _ in 0..100 {
        if !tree::is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[cfg(unix)]
#[tokio::test]
async fn halt_terminates_running_command() {
    let (port, _dir) = start_gateway(&["^echo"]).await;
    let mut ws = connect(port).await;
    let pid = start_sleeper(&mut ws, "4").await;
    assert!(tree::is_alive(pid));

    send_request(&mut ws, json!({"type": "halt", "id": "5"})).await;
    let mut completed = Vec::new();
    while completed.len() < 2 {
        let ev = next_response(&mut ws).await;
        if ev["stream"] == "completed" {
            completed.push((ev["id"].as_str().unwrap().to_string(), ev["data"].as_i64().unwrap()));
        }
    }
    assert!(completed.contains(&("5".to_string(), 0)));
    assert!(completed.iter().any(|(id, code)| id == "4" && *code != 0));
    assert!(wait_dead(pid).await);
}

#[cfg(unix)]
#[tokio::test]
async fn disconnect_kills_session_processes() {
    let (port, _dir) = start_gateway(&["^echo"]).await;
    let mut ws = connect(port).await;
    let pid = start_sleeper(&mut ws, "6").await;

    ws.close(None).await.expect("close");
    drop(ws);
    assert!(wait_dead(pid).await, "process {} outlived its session", pid);
}

#[cfg(unix)]
#[tokio::test]
async fn disconnect_right_after_request_kills_the_command() {
    let (port, dir) = start_gateway(&["^echo"]).await;
    let pid_file = dir.path().join("pid");
    let mut ws = connect(port).await;
    let cmd = format!("echo $$ > {}; sleep 30", pid_file.display());
    send_request(&mut ws, json!({"type": "command", "id": "7", "cmd": cmd})).await;
    ws.close(None).await.expect("close");
    drop(ws);

    // give a command that did start time to write its pid
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Some(pid) = std::fs::read_to_string(&pid_file)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
    {
        assert!(wait_dead(pid).await, "process {} outlived its session", pid);
    }
}
