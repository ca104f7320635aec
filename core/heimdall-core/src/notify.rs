//! Outbound notification path.
//!
//! Producers push onto a bounded queue; a single drain thread delivers
//! through the configured [`Notifier`]. Delivery failure is logged and falls
//! back to ringing the terminal bell — it is never surfaced to an RPC
//! caller, since notification is detached from the command lifecycle.

use std::process::Command;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread;

use crate::error::CoreError;

/// Queue depth before producers block. Producers run on detached threads,
/// so blocking here never stalls an RPC response.
pub const MESSAGE_QUEUE_DEPTH: usize = 42;

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str) -> Result<(), CoreError>;
}

/// Posts messages to a chat webhook (Google Chat style: a JSON body with a
/// `text` field).
pub struct ChatNotifier {
    client: reqwest::blocking::Client,
    webhook_url: String,
}

impl ChatNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            webhook_url,
        }
    }
}

impl Notifier for ChatNotifier {
    fn notify(&self, message: &str) -> Result<(), CoreError> {
        self.client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| CoreError::Notify(err.to_string()))?;
        Ok(())
    }
}

/// Fallback when no webhook is configured: the message only reaches the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) -> Result<(), CoreError> {
        tracing::info!(message = %message, "Notification (no chat webhook configured)");
        Ok(())
    }
}

/// Producer handle to the notification queue.
#[derive(Clone)]
pub struct NotifyQueue {
    tx: SyncSender<String>,
}

impl NotifyQueue {
    /// Enqueues a message, blocking if the drain thread has fallen behind.
    pub fn push(&self, message: String) {
        if self.tx.send(message).is_err() {
            tracing::warn!("Notification queue is closed; message dropped");
        }
    }
}

/// Spawns the single drain thread and returns the producer handle.
pub fn spawn_drain(notifier: Arc<dyn Notifier>) -> NotifyQueue {
    let (tx, rx) = mpsc::sync_channel::<String>(MESSAGE_QUEUE_DEPTH);
    let spawned = thread::Builder::new()
        .name("notify-drain".to_string())
        .spawn(move || {
            for message in rx {
                if let Err(err) = notifier.notify(&message) {
                    tracing::error!(error = %err, "Failed to deliver notification");
                    ring_terminal_bell();
                }
            }
        });
    if let Err(err) = spawned {
        tracing::error!(error = %err, "Failed to spawn notification drain");
    }
    NotifyQueue { tx }
}

fn ring_terminal_bell() {
    match Command::new("tput").arg("bel").status() {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(code = ?status.code(), "tput bel exited non-zero"),
        Err(err) => tracing::warn!(error = %err, "Failed to ring terminal bell"),
    }
}
