//! Multiplexer contract tests: correlation, cancellation, timeout, and
//! crash drain, driven over in-memory pipes and (on unix) a scripted
//! fake browser process.

use owld::error::IpcError;
use owld::ipc::{BrowserIpc, BrowserState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Mutex;

/// Wire a multiplexer to an in-memory "browser" end.
fn attach_pair() -> (BrowserIpc, DuplexStream) {
    let (gateway_side, browser_side) = tokio::io::duplex(1024 * 1024);
    let (read_half, write_half) = tokio::io::split(gateway_side);
    let ipc = BrowserIpc::attach(read_half, write_half, Duration::from_secs(5));
    (ipc, browser_side)
}

/// Drive the browser side: read command lines, hand them to `respond`,
/// write whatever lines it returns. Records every command seen.
fn spawn_fake_browser<F>(
    browser_side: DuplexStream,
    respond: F,
) -> Arc<Mutex<Vec<Value>>>
where
    F: Fn(&Value) -> Vec<String> + Send + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = seen.clone();
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(browser_side);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let cmd: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            seen_writer.lock().await.push(cmd.clone());
            for reply in respond(&cmd) {
                if write_half.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
    seen
}

fn echo_reply(cmd: &Value) -> Vec<String> {
    let id = cmd["id"].as_u64().unwrap();
    vec![format!(
        "{}\n",
        json!({"id": id, "result": {"echo": cmd["params"].clone(), "method": cmd["method"].clone()}})
    )]
}

// ─── Correlation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_sends_each_get_their_own_reply() {
    let (ipc, browser) = attach_pair();
    let _seen = spawn_fake_browser(browser, echo_reply);
    let ipc = Arc::new(ipc);

    let mut handles = Vec::new();
    for n in 0..32u64 {
        let ipc = ipc.clone();
        handles.push(tokio::spawn(async move {
            let result = ipc
                .call("probe", json!({"n": n}), Some(Duration::from_secs(5)))
                .await
                .expect("call failed");
            (n, result)
        }));
    }
    for h in handles {
        let (n, result) = h.await.unwrap();
        assert_eq!(result["echo"]["n"], n, "reply crossed wires for {n}");
        assert_eq!(result["method"], "probe");
    }
    assert_eq!(ipc.pending_count(), 0);
}

#[tokio::test]
async fn out_of_order_replies_still_correlate() {
    let (ipc, browser) = attach_pair();
    // Batch four commands, answer them in reverse order.
    let pending = Arc::new(std::sync::Mutex::new(Vec::<Value>::new()));
    let pending_in = pending.clone();
    let _seen = spawn_fake_browser(browser, move |cmd| {
        let mut batch = pending_in.lock().unwrap();
        batch.push(cmd.clone());
        if batch.len() < 4 {
            return Vec::new();
        }
        batch
            .drain(..)
            .rev()
            .map(|c| {
                let id = c["id"].as_u64().unwrap();
                format!("{}\n", json!({"id": id, "result": {"tag": c["params"]["tag"].clone()}}))
            })
            .collect()
    });

    let ipc = Arc::new(ipc);
    let mut handles = Vec::new();
    for tag in ["a", "b", "c", "d"] {
        let ipc = ipc.clone();
        handles.push(tokio::spawn(async move {
            let r = ipc
                .call("probe", json!({"tag": tag}), Some(Duration::from_secs(5)))
                .await
                .unwrap();
            (tag, r)
        }));
    }
    for h in handles {
        let (tag, r) = h.await.unwrap();
        assert_eq!(r["tag"], tag);
    }
}

#[tokio::test]
async fn browser_error_reply_surfaces_as_browser_error() {
    let (ipc, browser) = attach_pair();
    let _seen = spawn_fake_browser(browser, |cmd| {
        let id = cmd["id"].as_u64().unwrap();
        vec![format!(
            "{}\n",
            json!({"id": id, "error": {"code": -32000, "message": "no such context"}})
        )]
    });

    let err = ipc
        .call("navigate", json!({"url": "x"}), Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    match err {
        IpcError::Browser { code, message } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "no such context");
        }
        other => panic!("expected Browser error, got {other:?}"),
    }
}

#[tokio::test]
async fn junk_lines_never_block_pending_requests() {
    let (ipc, browser) = attach_pair();
    let _seen = spawn_fake_browser(browser, |cmd| {
        let id = cmd["id"].as_u64().unwrap();
        vec![
            "this is not json\n".to_string(),
            "{\"half\": true\n".to_string(),
            format!("{}\n", json!({"id": id, "result": {"ok": true}})),
        ]
    });

    let result = ipc
        .call("probe", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result["ok"], true);
    assert!(ipc.stats()["dropped_lines"].as_u64().unwrap() >= 2);
}

// ─── Cancellation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_fires_once_and_late_reply_is_dropped() {
    let (ipc, browser) = attach_pair();
    // Browser answers only after being poked via the second command.
    let stash = Arc::new(std::sync::Mutex::new(None::<u64>));
    let stash_in = stash.clone();
    let _seen = spawn_fake_browser(browser, move |cmd| {
        let id = cmd["id"].as_u64().unwrap();
        match cmd["method"].as_str().unwrap() {
            "hang" => {
                *stash_in.lock().unwrap() = Some(id);
                Vec::new()
            }
            "poke" => {
                let hung = stash_in.lock().unwrap().take();
                let mut replies = Vec::new();
                if let Some(hung_id) = hung {
                    // The reply for the cancelled command...
                    replies.push(format!("{}\n", json!({"id": hung_id, "result": {"late": true}})));
                }
                replies.push(format!("{}\n", json!({"id": id, "result": {"ok": true}})));
                replies
            }
            _ => Vec::new(),
        }
    });

    let handle = ipc
        .send("hang", json!({}), Some(Duration::from_secs(30)))
        .unwrap();
    let id = handle.id;

    // Give the command time to reach the fake browser, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ipc.cancel(id));
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, IpcError::Cancelled));

    // Provoke the late reply for the cancelled id; it must vanish.
    let poke = ipc
        .call("poke", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(poke["ok"], true);
    assert_eq!(ipc.stats()["unmatched_replies"], 1);
    assert_eq!(ipc.pending_count(), 0);

    // Cancelling again is a no-op.
    assert!(!ipc.cancel(id));
}

// ─── Timeout ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn deadline_completes_once_with_timeout_and_late_reply_is_unmatched() {
    let (ipc, browser) = attach_pair();
    let stash = Arc::new(std::sync::Mutex::new(None::<u64>));
    let stash_in = stash.clone();
    let _seen = spawn_fake_browser(browser, move |cmd| {
        let id = cmd["id"].as_u64().unwrap();
        match cmd["method"].as_str().unwrap() {
            "hang" => {
                *stash_in.lock().unwrap() = Some(id);
                Vec::new()
            }
            "poke" => {
                let hung = stash_in.lock().unwrap().take();
                let mut replies = Vec::new();
                if let Some(hung_id) = hung {
                    replies.push(format!("{}\n", json!({"id": hung_id, "result": {}})));
                }
                replies.push(format!("{}\n", json!({"id": id, "result": {}})));
                replies
            }
            _ => Vec::new(),
        }
    });

    let start = std::time::Instant::now();
    let err = ipc
        .call("hang", json!({}), Some(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Timeout));
    // The sweep runs every 50 ms; the timeout should land near the deadline.
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(ipc.stats()["commands_timeout"], 1);

    // A reply after the timeout is dropped as unmatched, not re-delivered.
    ipc.call("poke", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(ipc.stats()["unmatched_replies"], 1);
}

// ─── Crash drain ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn browser_exit_drains_every_pending_future() {
    let (ipc, browser) = attach_pair();
    // A browser that swallows everything.
    let browser = Arc::new(Mutex::new(Some(browser)));
    {
        let browser = browser.clone();
        tokio::spawn(async move {
            let stream = browser.lock().await.take().unwrap();
            let (read_half, _write_half) = tokio::io::split(stream);
            let mut lines = BufReader::new(read_half).lines();
            // Read three commands, then drop the connection entirely.
            for _ in 0..3 {
                let _ = lines.next_line().await;
            }
            // Dropping read+write simulates the process dying.
        });
    }

    let ipc = Arc::new(ipc);
    let mut handles = Vec::new();
    for _ in 0..3 {
        let ipc = ipc.clone();
        handles.push(tokio::spawn(async move {
            ipc.call("hang", json!({}), Some(Duration::from_secs(30))).await
        }));
    }

    let mut crashed = 0;
    for h in handles {
        match h.await.unwrap() {
            Err(IpcError::BrowserCrashed) => crashed += 1,
            other => panic!("expected BrowserCrashed, got {other:?}"),
        }
    }
    assert_eq!(crashed, 3);
    assert_eq!(ipc.pending_count(), 0, "table drained");
    assert_eq!(ipc.state(), BrowserState::Error);

    // Sends after the crash fail fast.
    assert!(matches!(
        ipc.send("probe", json!({}), None),
        Err(IpcError::BrowserCrashed)
    ));
}

#[tokio::test]
async fn stop_drains_pending_and_reaches_stopped() {
    let (ipc, browser) = attach_pair();
    // Browser never replies; keep its end alive until the test ends.
    let _keep = tokio::spawn(async move {
        let (read_half, _w) = tokio::io::split(browser);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let handle = ipc
        .send("hang", json!({}), Some(Duration::from_secs(60)))
        .unwrap();
    ipc.stop().await;
    assert_eq!(ipc.state(), BrowserState::Stopped);
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, IpcError::BrowserCrashed));
    assert!(matches!(
        ipc.send("probe", json!({}), None),
        Err(IpcError::Stopped)
    ));
}

// ─── Real process lifecycle (unix: scripted fake browser binary) ─────────────

#[cfg(unix)]
mod process {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        drop(f);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Replies `{"id":N,"result":{"ok":true}}` to every command.
    const ECHO_BROWSER: &str = r#"#!/bin/sh
echo '{"event":"ready"}' >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -E 's/^\{"id":([0-9]+).*/\1/')
  printf '{"id":%s,"result":{"ok":true}}\n' "$id"
done
"#;

    const LICENSE_BROWSER: &str = r#"#!/bin/sh
echo '{"event":"license_error","status":"expired","message":"seat expired","fingerprint":"aa:bb:cc"}' >&2
sleep 60
"#;

    const CRASH_BROWSER: &str = r#"#!/bin/sh
echo '{"event":"ready"}' >&2
IFS= read -r line
exit 7
"#;

    #[tokio::test]
    async fn spawn_ready_roundtrip_stop() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "owl_browser.sh", ECHO_BROWSER);

        let ipc = BrowserIpc::new(Some(script), Duration::from_secs(5));
        ipc.start().await.unwrap();
        ipc.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ipc.state(), BrowserState::Ready);
        assert!(ipc.instance_id().is_some());

        let result = ipc
            .call("navigate", json!({"url": "https://example.org"}), None)
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        ipc.stop().await;
        assert_eq!(ipc.state(), BrowserState::Stopped);
    }

    #[tokio::test]
    async fn license_error_fails_sends_fast() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "owl_browser.sh", LICENSE_BROWSER);

        let ipc = BrowserIpc::new(Some(script), Duration::from_secs(5));
        ipc.start().await.unwrap();
        let err = ipc.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        match &err {
            IpcError::License {
                status,
                message,
                fingerprint,
            } => {
                assert_eq!(status, "expired");
                assert_eq!(message, "seat expired");
                assert_eq!(fingerprint, "aa:bb:cc");
            }
            other => panic!("expected License, got {other:?}"),
        }
        assert_eq!(ipc.state(), BrowserState::LicenseError);
        assert!(matches!(
            ipc.send("probe", json!({}), None),
            Err(IpcError::License { .. })
        ));
        ipc.stop().await;
    }

    #[tokio::test]
    async fn crash_then_restart_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "owl_browser.sh", CRASH_BROWSER);

        let ipc = BrowserIpc::new(Some(script.clone()), Duration::from_secs(5));
        ipc.start().await.unwrap();
        ipc.wait_ready(Duration::from_secs(5)).await.unwrap();

        // First command makes the script exit without replying.
        let err = ipc
            .call("boom", json!({}), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::BrowserCrashed | IpcError::Timeout
        ));

        // Swap in a healthy script and restart.
        std::fs::write(&script, ECHO_BROWSER).unwrap();
        ipc.restart().await.unwrap();
        ipc.wait_ready(Duration::from_secs(5)).await.unwrap();
        let result = ipc.call("probe", json!({}), None).await.unwrap();
        assert_eq!(result["ok"], true);
        ipc.stop().await;
    }
}
