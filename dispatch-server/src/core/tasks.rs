//! Long-lived tasks of the dispatch server
//!
//! The hub listener, the event router, the failed-stop refresh and the
//! archive scan run for the whole life of the process. They share one
//! cancellation token and are awaited together on shutdown. A task that
//! panics or returns early is logged; the others keep running.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Accepts device and console connections
    Hub,
    /// Consumes the route event stream
    Listener,
    /// Handles work a listener hands over
    Worker,
    /// Timer driven
    Periodic,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Hub => "hub",
            TaskKind::Listener => "listener",
            TaskKind::Worker => "worker",
            TaskKind::Periodic => "periodic",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Entry {
    name: &'static str,
    kind: TaskKind,
    handle: JoinHandle<()>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Registry of the server's background tasks
pub struct BackgroundTasks {
    entries: Vec<Entry>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token every task watches
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, kind: TaskKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(()) if token.is_cancelled() => tracing::debug!(task = name, "Task stopped"),
                Ok(()) => tracing::warn!(task = name, kind = %kind, "Task returned before shutdown"),
                Err(payload) => tracing::error!(
                    task = name,
                    kind = %kind,
                    panic = panic_message(payload.as_ref()),
                    "Task panicked"
                ),
            }
        });
        self.entries.push(Entry { name, kind, handle });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tasks that are no longer running although shutdown was not requested
    pub fn stopped(&self) -> Vec<&'static str> {
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.handle.is_finished())
            .map(|e| e.name)
            .collect()
    }

    pub fn log_summary(&self) {
        let tasks: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}({})", e.name, e.kind))
            .collect();
        tracing::info!(count = tasks.len(), tasks = ?tasks, "Background tasks running");
    }

    /// Cancel every task and wait for all of them
    pub async fn shutdown(self) {
        tracing::info!(count = self.entries.len(), "Stopping background tasks");
        self.shutdown.cancel();

        let (names, handles): (Vec<_>, Vec<_>) =
            self.entries.into_iter().map(|e| (e.name, e.handle)).unzip();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                tracing::error!(task = name, error = ?e, "Task did not stop cleanly");
            }
        }
        tracing::info!("Background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_stop_on_shutdown() {
        let mut tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();
        tasks.spawn("route_archive", TaskKind::Periodic, async move {
            token.cancelled().await;
        });
        assert_eq!(tasks.len(), 1);
        assert!(tasks.stopped().is_empty());

        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let mut tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();
        tasks.spawn("event_router", TaskKind::Listener, async move {
            token.cancelled().await;
        });
        tasks.spawn("failed_stop_refresh", TaskKind::Worker, async {
            panic!("refresh exploded");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tasks.stopped(), ["failed_stop_refresh"]);
        tasks.shutdown().await;
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
