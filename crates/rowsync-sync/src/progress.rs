//! Typed progress frames from a running job to one remote observer.

use rowsync_core::SyncSummary;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_STREAM_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressFrame {
    Progress {
        message: String,
        percent: u8,
    },
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete {
        summary: SyncSummary,
    },
    Error {
        message: String,
    },
}

impl ProgressFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressFrame::Complete { .. } | ProgressFrame::Error { .. })
    }

    /// SSE event name for this frame.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressFrame::Progress { .. } => "progress",
            ProgressFrame::Log { .. } => "log",
            ProgressFrame::Complete { .. } => "complete",
            ProgressFrame::Error { .. } => "error",
        }
    }
}

pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Producer half. Exactly one of [`ProgressSender::complete`] or
/// [`ProgressSender::fail`] ends the stream; dropping an unfinished sender
/// emits an error frame instead.
#[derive(Debug)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressFrame>>,
    cancel: CancellationToken,
    finished: bool,
}

pub fn progress_channel(capacity: usize) -> (ProgressSender, mpsc::Receiver<ProgressFrame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressSender {
            tx: Some(tx),
            cancel: CancellationToken::new(),
            finished: false,
        },
        rx,
    )
}

impl ProgressSender {
    /// Sender with no observer; frames are discarded.
    pub fn detached() -> Self {
        Self {
            tx: None,
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once the observer disconnected or cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    async fn send(&self, frame: ProgressFrame) {
        if let Some(tx) = &self.tx {
            // A closed receiver is observed through `is_cancelled`.
            let _ = tx.send(frame).await;
        }
    }

    pub async fn progress(&self, message: impl Into<String>, percent: u8) {
        self.send(ProgressFrame::Progress {
            message: message.into(),
            percent: percent.min(100),
        })
        .await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, detail: Option<String>) {
        self.send(ProgressFrame::Log {
            level,
            message: message.into(),
            detail,
        })
        .await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message, None).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None).await;
    }

    pub async fn error(&self, message: impl Into<String>, detail: Option<String>) {
        self.log(LogLevel::Error, message, detail).await;
    }

    pub async fn complete(mut self, summary: SyncSummary) {
        self.finished = true;
        self.send(ProgressFrame::Complete { summary }).await;
    }

    pub async fn fail(mut self, message: impl Into<String>) {
        self.finished = true;
        self.send(ProgressFrame::Error {
            message: message.into(),
        })
        .await;
    }
}

impl Drop for ProgressSender {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(ProgressFrame::Error {
                message: "job stopped before reporting a result".to_string(),
            });
        }
    }
}
