//! Control-protocol runner tests
//!
//! Drives the `mcp-bridge` binary over its stdin/stdout exactly as an
//! embedding host process would.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

struct Runner {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Runner {
    fn spawn() -> Runner {
        let mut child = Command::new(env!("CARGO_BIN_EXE_mcp-bridge"))
            .arg("serve")
            .arg("--config")
            .arg("/nonexistent/mcp-bridge.yaml")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn mcp-bridge");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        Runner {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.unwrap();
        self.stdin.flush().await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("runner replied in time")
            .unwrap()
            .expect("runner produced a line");
        serde_json::from_str(&reply).unwrap()
    }
}

#[tokio::test]
async fn test_full_session_over_stdio() {
    let mut runner = Runner::spawn();

    let reply = runner.call(json!({ "method": "initialize", "args": {} })).await;
    assert_eq!(reply, json!({ "result": null }));

    let reply = runner
        .call(json!({
            "method": "create_connection",
            "args": { "config": { "serverId": "echo", "command": env!("CARGO_BIN_EXE_echo_server"), "args": [] } }
        }))
        .await;
    let id = reply["result"].as_str().expect("connection id").to_string();
    assert!(!id.is_empty());

    let reply = runner
        .call(json!({ "method": "get_status", "args": { "connection_id": id } }))
        .await;
    assert_eq!(reply["result"]["status"], "connected");
    assert!(reply["result"]["uptime"].as_u64().is_some());

    let reply = runner
        .call(json!({
            "method": "send_message",
            "args": {
                "connection_id": id,
                "message": { "jsonrpc": "2.0", "id": 1, "method": "echo", "params": { "v": 42 } }
            }
        }))
        .await;
    assert_eq!(reply["result"]["result"]["v"], 42);

    let reply = runner
        .call(json!({ "method": "close_connection", "args": { "connection_id": id } }))
        .await;
    assert_eq!(reply, json!({ "result": null }));

    let reply = runner
        .call(json!({ "method": "get_status", "args": { "connection_id": id } }))
        .await;
    let status = reply["result"]["status"].as_str().unwrap();
    assert!(status == "disconnected" || status == "unknown");

    drop(runner.stdin);
    let exit = tokio::time::timeout(Duration::from_secs(10), runner.child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(exit.success());
}

#[tokio::test]
async fn test_errors_are_reported_per_line() {
    let mut runner = Runner::spawn();

    let reply = runner
        .call(json!({ "method": "create_connection", "args": { "config": { "command": "x" } } }))
        .await;
    assert_eq!(reply["error"], "Transport not initialized");

    runner.call(json!({ "method": "initialize" })).await;

    let reply = runner
        .call(json!({
            "method": "send_message",
            "args": { "connection_id": "stdio-missing", "message": { "jsonrpc": "2.0", "method": "n" } }
        }))
        .await;
    assert!(reply["error"].as_str().unwrap().contains("Connection not found"));

    let reply = runner.call(json!({ "method": "explode" })).await;
    assert!(reply["error"].as_str().unwrap().contains("unknown method"));
}
