//! Echo server binary for integration tests
//!
//! A minimal newline-delimited JSON-RPC server on stdin/stdout used to
//! exercise the stdio adapter and the stdio detection probe without a real
//! external server.
//!
//! # Handled Methods
//!
//! - `echo` -- responds with `result` equal to `params` (`null` if absent).
//! - `ping` -- responds with `result: "pong"`.
//! - `sleep` -- never responds.
//! - `delay` -- responds with `params` after `params.ms` milliseconds,
//!   from a background thread, so later requests can overtake it.
//! - `split` -- writes the response in two partial writes.
//! - `noisy` -- writes a malformed line and a server notification before
//!   the response.
//! - `exit` -- exits immediately with `params.code` (default 0).
//! - All other methods -- returns a `-32601 Method not found` error.
//!
//! Notifications (no `id`) are read and ignored. Diagnostic text goes to
//! stderr.
//!
//! # Flags
//!
//! - `--version` prints `echo-server mcp 0.1.0` and exits 0.
//! - `--fail` exits 2 immediately.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

type Out = Arc<Mutex<io::Stdout>>;

fn main() {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--version") => {
            println!("echo-server mcp 0.1.0");
            return;
        }
        Some("--fail") => std::process::exit(2),
        _ => {}
    }

    eprintln!("echo-server: ready");

    let out: Out = Arc::new(Mutex::new(io::stdout()));
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                eprintln!("echo-server: ignoring malformed input");
                continue;
            }
        };

        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let Some(id) = request.get("id").cloned() else {
            eprintln!("echo-server: notification {}", method);
            continue;
        };

        match method.as_str() {
            "echo" => write_line(&out, &result(&id, params)),
            "ping" => write_line(&out, &result(&id, json!("pong"))),
            "sleep" => {}
            "delay" => {
                let ms = params.get("ms").and_then(|v| v.as_u64()).unwrap_or(100);
                let out = Arc::clone(&out);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(ms));
                    write_line(&out, &result(&id, params));
                });
            }
            "split" => {
                let text = format!("{}\n", result(&id, params));
                let (head, tail) = text.split_at(text.len() / 2);
                write_raw(&out, head);
                thread::sleep(Duration::from_millis(50));
                write_raw(&out, tail);
            }
            "noisy" => {
                write_raw(&out, "this is not json\n");
                write_line(
                    &out,
                    &json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
                );
                write_line(&out, &result(&id, params));
            }
            "exit" => {
                let code = params.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
                eprintln!("echo-server: exiting with {}", code);
                std::process::exit(code as i32);
            }
            other => write_line(
                &out,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("Method not found: {}", other)}
                }),
            ),
        }
    }
}

fn result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn write_line(out: &Out, value: &Value) {
    write_raw(out, &format!("{}\n", value));
}

fn write_raw(out: &Out, text: &str) {
    if let Ok(mut out) = out.lock() {
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}
