//! Shared helpers for integration tests that spawn real processes

#![allow(dead_code)]

use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Spawn a sleep process that lives long enough for any test.
pub fn spawn_sleep(secs: u32) -> Child {
    Command::new("/bin/sleep")
        .arg(secs.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn sleep")
}

/// Spawn a shell that ignores SIGTERM, forcing the SIGKILL path.
pub fn spawn_stubborn() -> Child {
    Command::new("/bin/sh")
        .args(["-c", "trap '' TERM; sleep 600"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn stubborn child")
}

/// Spawn a process and reap it, yielding a pid that no longer exists.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("/bin/true")
        .spawn()
        .expect("failed to spawn true");
    let pid = child.id();
    child.wait().expect("failed to wait for true");
    pid
}

pub fn pid_is_alive(pid: u32) -> bool {
    // Same view the supervisor has: zombies awaiting our reap count as gone.
    use orphand::ProcessProbe;
    orphand::SystemProbe::new().is_running(pid)
}

/// Kill a test process outright and reap it.
pub fn kill_and_reap(child: &mut Child) {
    child.kill().ok();
    child.wait().ok();
}

/// Wait until `predicate` holds or the timeout elapses.
pub async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
