//! Heartbeat loop
//!
//! While a session is live, a background task sends the heartbeat command,
//! then sleeps for the interval, and repeats. The first heartbeat goes out
//! immediately. Cancellation is observed during both the send and the sleep,
//! so once `stop` returns no further heartbeat leaves this loop.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::session::CommandSender;
use crate::protocol::HEARTBEAT_COMMAND;

/// Periodic keepalive for one session
pub struct HeartbeatLoop {
    sender: CommandSender,
    interval: Duration,
    cancel: CancellationToken,
}

impl HeartbeatLoop {
    /// `parent` cancels this loop too; a process shutdown stops every heartbeat
    pub fn new(sender: CommandSender, interval: Duration, parent: &CancellationToken) -> Self {
        Self {
            sender,
            interval,
            cancel: parent.child_token(),
        }
    }

    /// Start the loop on the runtime
    pub fn spawn(self) -> HeartbeatHandle {
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        HeartbeatHandle { cancel, task }
    }

    async fn run(self) -> u64 {
        let mut sent = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.sender.send(HEARTBEAT_COMMAND) => match result {
                    Ok(()) => sent += 1,
                    // The reader notices dead sessions; keep ticking until cancelled
                    Err(e) => warn!(error = %e, "Heartbeat not sent"),
                },
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!(sent, "Heartbeat loop stopped");
        sent
    }
}

/// Handle to a running heartbeat task
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<u64>,
}

impl HeartbeatHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel and wait for the task to exit; returns heartbeats sent
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        match self.task.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(error = %e, "Heartbeat task ended abnormally");
                0
            }
        }
    }
}
