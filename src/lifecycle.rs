// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle loop: drains a backlog of disowned copies in bounded bursts.
//!
//! The loop is a small state machine held as data ([`LoopContext`]) and
//! advanced one transition at a time by [`LifecycleLoop::step`]. The driver
//! ([`LifecycleLoop::run_from`]) applies the overall deadline.
//!
//! # State Transitions
//!
//! ```text
//!              ┌────────────────────────────────────────┐
//!              ▼                                        │ continue
//! CHECK_CONTINUE ──► INVOKE_CLEANER ──► WAIT ──► CHECK_CONTINUE
//!      │ !continue                                      │ !continue
//!      ▼                                                ▼
//!   SUCCESS                                          SUCCESS
//!
//! any state ── deadline passed ──► TIMED_OUT
//! ```
//!
//! A run enters at `CHECK_CONTINUE`. A fresh invocation carries no
//! `continue` flag, which reads as true, so the first transition invokes the
//! cleaner. An invocation with `{"continue": false}` ends in `SUCCESS`
//! without touching the cleaner.

use crate::cleaner::{CleanupReport, Cleaner};
use crate::config::LifecycleConfig;
use crate::error::{BackupError, Result};
use crate::metadata::MetadataStore;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    InvokeCleaner,
    Wait,
    CheckContinue,
    Success,
    TimedOut,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvokeCleaner => "INVOKE_CLEANER",
            Self::Wait => "WAIT",
            Self::CheckContinue => "CHECK_CONTINUE",
            Self::Success => "SUCCESS",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invocation payload carrying the remaining-work flag between steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopPayload {
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_flag: Option<bool>,
}

impl LoopPayload {
    pub fn stop() -> Self {
        Self {
            continue_flag: Some(false),
        }
    }

    /// Absent flag means continue.
    pub fn should_continue(&self) -> bool {
        self.continue_flag.unwrap_or(true)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| BackupError::InvalidEvent(format!("loop payload: {}", e)))
    }
}

/// Current state plus what the loop has done so far.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub state: LoopState,
    pub payload: LoopPayload,
    pub passes: u32,
    pub reclaimed: usize,
    pub failed: usize,
    pub last_report: Option<CleanupReport>,
}

impl LoopContext {
    pub fn new(payload: LoopPayload) -> Self {
        Self {
            state: LoopState::CheckContinue,
            payload,
            passes: 0,
            reclaimed: 0,
            failed: 0,
            last_report: None,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub state: LoopState,
    pub passes: u32,
    pub reclaimed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Drives the cleaner until the backlog is drained or the deadline passes.
pub struct LifecycleLoop<M: MetadataStore> {
    cleaner: Arc<Cleaner<M>>,
    wait_interval: Duration,
    timeout: Duration,
}

impl<M: MetadataStore> LifecycleLoop<M> {
    pub fn new(cleaner: Arc<Cleaner<M>>, config: &LifecycleConfig) -> Self {
        Self::with_timing(cleaner, config.wait_interval_duration(), config.timeout_duration())
    }

    pub fn with_timing(cleaner: Arc<Cleaner<M>>, wait_interval: Duration, timeout: Duration) -> Self {
        Self {
            cleaner,
            wait_interval,
            timeout,
        }
    }

    pub fn wait_interval(&self) -> Duration {
        self.wait_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply one transition. Terminal states are left unchanged.
    pub async fn step(&self, ctx: &mut LoopContext) -> Result<()> {
        ctx.state = match ctx.state {
            LoopState::InvokeCleaner => {
                let report = self.cleaner.run_once().await?;
                ctx.passes += 1;
                ctx.reclaimed += report.reclaimed;
                ctx.failed += report.failed;
                ctx.payload.continue_flag = Some(report.remaining);
                ctx.last_report = Some(report);
                LoopState::Wait
            }
            LoopState::Wait => {
                tokio::time::sleep(self.wait_interval).await;
                LoopState::CheckContinue
            }
            LoopState::CheckContinue => {
                if ctx.payload.should_continue() {
                    LoopState::InvokeCleaner
                } else {
                    LoopState::Success
                }
            }
            terminal => terminal,
        };
        Ok(())
    }

    /// Fresh run (no continue flag).
    pub async fn run(&self) -> Result<LoopOutcome> {
        self.run_from(LoopPayload::default()).await
    }

    /// Run to a terminal state under the overall deadline.
    ///
    /// A timeout returns [`BackupError::LifecycleTimeout`]; a cleaner pass
    /// that cannot query the metadata store ends the run with that error.
    pub async fn run_from(&self, payload: LoopPayload) -> Result<LoopOutcome> {
        let span = info_span!("lifecycle_loop", timeout_secs = self.timeout.as_secs());

        async move {
            let start = Instant::now();
            let deadline = start + self.timeout;
            let mut ctx = LoopContext::new(payload);

            while !ctx.state.is_terminal() {
                let from = ctx.state;
                match tokio::time::timeout_at(deadline, self.step(&mut ctx)).await {
                    Ok(Ok(())) => debug!(from = %from, to = %ctx.state, "Loop transition"),
                    Ok(Err(e)) => {
                        warn!(state = %from, passes = ctx.passes, error = %e, "Lifecycle loop failed");
                        metrics::record_lifecycle_run("FAILED", ctx.passes, start.elapsed());
                        return Err(e);
                    }
                    Err(_) => {
                        ctx.state = LoopState::TimedOut;
                        let elapsed = start.elapsed();
                        warn!(
                            passes = ctx.passes,
                            reclaimed = ctx.reclaimed,
                            elapsed_secs = elapsed.as_secs(),
                            "Lifecycle loop hit its timeout"
                        );
                        metrics::record_lifecycle_run(ctx.state.as_str(), ctx.passes, elapsed);
                        return Err(BackupError::LifecycleTimeout {
                            passes: ctx.passes,
                            reclaimed: ctx.reclaimed,
                            elapsed,
                        });
                    }
                }
            }

            let outcome = LoopOutcome {
                state: ctx.state,
                passes: ctx.passes,
                reclaimed: ctx.reclaimed,
                failed: ctx.failed,
                elapsed: start.elapsed(),
            };
            metrics::record_lifecycle_run(outcome.state.as_str(), outcome.passes, outcome.elapsed);
            info!(
                passes = outcome.passes,
                reclaimed = outcome.reclaimed,
                failed = outcome.failed,
                "Lifecycle loop finished"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}
