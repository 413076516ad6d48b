//! Process-level shutdown of the `stream` command.

#![cfg(unix)]

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_sigterm_exits_while_stdin_is_idle() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_probe-collector"))
        .args(["stream", "--raw"])
        .env("ENDPOINT_ID", "ep-shutdown")
        .env("SERVER_URL", "http://127.0.0.1:9")
        .env("ALLOW_INSECURE_HTTP", "true")
        .env("API_KEY", "secret")
        .env("WLAN_IFACE", "wlan1")
        .env("LOG_LEVEL", "warn")
        .env_remove("RUST_LOG")
        // Held open and never written, so the stdin read stays parked
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Let the signal handlers install
    thread::sleep(Duration::from_secs(1));

    let killed = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break Some(status);
        }
        if Instant::now() >= deadline {
            break None;
        }
        thread::sleep(Duration::from_millis(50));
    };

    let Some(status) = status else {
        child.kill().unwrap();
        panic!("collector still running 10s after SIGTERM");
    };
    assert!(status.success(), "exit status {:?}", status);
}
