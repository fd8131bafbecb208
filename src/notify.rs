//! Change notifications
//!
//! The reconciler reports additions and failures through a [`Notifier`]
//! passed in by the caller. Delivery is fire-and-forget: a notifier must never
//! fail the reconciliation that triggered it.

use std::ffi::OsString;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{info, warn};

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!(target: "nftsync::notify", "{message}");
    }
}

/// Spawns a hook program with the message as its only argument.
///
/// The hook is not waited for: a detached thread reaps it. Spawn failures are
/// logged and dropped.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: OsString,
}

impl CommandNotifier {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Starts the hook and hands it to a thread that waits for its exit.
    fn spawn_hook(
        &self,
        message: &str,
    ) -> std::io::Result<JoinHandle<std::io::Result<ExitStatus>>> {
        let mut child = Command::new(&self.program)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(std::thread::spawn(move || child.wait()))
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, message: &str) {
        info!(target: "nftsync::notify", "{message}");

        if let Err(e) = self.spawn_hook(message) {
            warn!(
                "Notification hook {} failed to start: {e}",
                self.program.to_string_lossy()
            );
        }
    }
}

/// Collects messages in memory
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_notifier_keeps_order() {
        let notifier = MemoryNotifier::new();
        notifier.notify("first");
        notifier.notify("second");
        assert_eq!(notifier.messages(), vec!["first", "second"]);
    }

    #[test]
    fn test_missing_hook_does_not_panic() {
        let notifier = CommandNotifier::new("/nonexistent/nftsync-hook");
        notifier.notify("added ssh (22/tcp) to @tcp_services");
    }

    #[test]
    fn test_hook_receives_message_and_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("notified");
        let notifier = CommandNotifier::new("touch");

        let waiter = notifier.spawn_hook(marker.to_str().unwrap()).unwrap();
        let status = waiter.join().unwrap().unwrap();

        assert!(status.success());
        assert!(marker.exists());
    }
}
