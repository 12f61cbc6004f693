//! Best-effort side effects
//!
//! Metrics writes and usage tracking must never fail or delay the response
//! they belong to. They are handed to `BackgroundTasks`, which either spawns
//! them onto the runtime or, in tests, runs them to completion in place. In
//! both modes a failure is logged and dropped.

use std::fmt::Display;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Detached,
    Inline,
}

#[derive(Debug, Clone, Copy)]
pub struct BackgroundTasks {
    mode: Mode,
}

impl BackgroundTasks {
    /// Spawns every task onto the tokio runtime and never joins it
    pub fn detached() -> Self {
        Self { mode: Mode::Detached }
    }

    /// Awaits every task before returning, for deterministic tests
    pub fn inline() -> Self {
        Self { mode: Mode::Inline }
    }

    /// Runs `task`, logging (never returning) its error
    pub async fn run<F, E>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let guarded = async move {
            if let Err(e) = task.await {
                tracing::warn!(task = label, "best-effort task failed: {}", e);
            }
        };

        match self.mode {
            Mode::Detached => {
                tokio::spawn(guarded);
            }
            Mode::Inline => guarded.await,
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::detached()
    }
}
