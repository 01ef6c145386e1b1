//! Watchdog enforcing the runtime cap and external stop signals
//!
//! Runs beside the pipeline. When the cap elapses or a stop is requested
//! it cancels in-flight execution, then forces the matching terminal
//! state through the controller. A parked task gets its own watchdog for
//! the approval window.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_exec::ExecutionEngine;

use crate::controller::GovernanceController;
use crate::state::ForcedTrigger;

/// Default hard runtime cap
pub const DEFAULT_RUNTIME_CAP: Duration = Duration::from_secs(15 * 60);

/// Handle to an armed watchdog
#[derive(Debug)]
pub struct Supervisor {
    handle: JoinHandle<Option<ForcedTrigger>>,
    disarm: CancellationToken,
}

impl Supervisor {
    /// Arm a watchdog with `budget` remaining
    ///
    /// `stop` is the external stop signal; `execution` is cancelled before
    /// the terminal transition so running commands stop first.
    pub fn arm(
        controller: Arc<GovernanceController>,
        budget: Duration,
        stop: CancellationToken,
        execution: CancellationToken,
    ) -> Self {
        let disarm = CancellationToken::new();
        let disarmed = disarm.clone();
        let handle = tokio::spawn(async move {
            let trigger = tokio::select! {
                biased;
                () = disarmed.cancelled() => return None,
                () = stop.cancelled() => ForcedTrigger::Interrupt,
                () = tokio::time::sleep(budget) => ForcedTrigger::Timeout,
            };
            execution.cancel();
            let detail = match trigger {
                ForcedTrigger::Timeout => format!("runtime cap exceeded ({}s remaining budget)", budget.as_secs()),
                _ => "stop signal received".to_string(),
            };
            tracing::warn!(%trigger, "supervisor firing");
            let outcome = tokio::task::spawn_blocking(move || controller.force_terminal(trigger, detail))
                .await
                .ok()?;
            outcome.applied().then_some(trigger)
        });
        Self { handle, disarm }
    }

    /// Watch a task parked in FEEDBACK_WAIT
    ///
    /// Forces FAILED_BY_INTERRUPT on `stop` and FAILED_BY_TIMEOUT once
    /// `window` elapses, then releases locks and stops the task's
    /// background servers.
    pub fn park(
        controller: Arc<GovernanceController>,
        window: Duration,
        stop: CancellationToken,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        let disarm = CancellationToken::new();
        let disarmed = disarm.clone();
        let handle = tokio::spawn(async move {
            let trigger = tokio::select! {
                biased;
                () = disarmed.cancelled() => return None,
                () = stop.cancelled() => ForcedTrigger::Interrupt,
                () = tokio::time::sleep(window) => ForcedTrigger::Timeout,
            };
            let detail = match trigger {
                ForcedTrigger::Timeout => format!("approval window expired after {}s", window.as_secs()),
                _ => "stop signal received while waiting".to_string(),
            };
            tracing::warn!(%trigger, "parked task forced out of feedback wait");
            let outcome = tokio::task::spawn_blocking(move || {
                let outcome = controller.force_terminal(trigger, detail);
                controller.locks().release_all();
                outcome
            })
            .await
            .ok()?;
            let stopped = engine.shutdown().await;
            tracing::info!(servers_stopped = stopped, "parked task finished");
            outcome.applied().then_some(trigger)
        });
        Self { handle, disarm }
    }

    /// Stop watching without waiting for the watchdog task
    pub fn cancel(&self) {
        self.disarm.cancel();
    }

    /// Stop watching; returns the trigger if the watchdog already fired
    pub async fn disarm(self) -> Option<ForcedTrigger> {
        self.disarm.cancel();
        self.handle.await.ok().flatten()
    }

    /// Wait for the watchdog to fire without disarming it
    pub async fn fired(self) -> Option<ForcedTrigger> {
        self.handle.await.ok().flatten()
    }
}
