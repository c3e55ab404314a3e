//! Background expiry scheduling.
//!
//! While running, up to two independent Tokio tasks share one cancellation
//! token:
//!
//! - the daily kill loop sleeps until the next occurrence of the kill time,
//!   purges every session, waits a one second settle delay and repeats;
//! - the sweep loop calls [`Provider::session_gc`] on a fixed interval equal
//!   to the tighter of the idle and lifetime limits.
//!
//! Both loops only observe cancellation while sleeping, so a sweep that is
//! already running when the scheduler stops is allowed to finish.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::log::LogSink;
use crate::provider::Provider;

const SECONDS_PER_DAY: i64 = 86_400;

/// Pause after a daily purge before the next wait is computed.
const KILL_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Whether GC loops are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Stopped,
    Running,
}

/// Parse a daily kill time given as "HH:MM" or "HH:MM:SS".
pub fn parse_kill_time(value: &str) -> Result<NaiveTime> {
    let format = match value.len() {
        8 => "%H:%M:%S",
        5 => "%H:%M",
        _ => return Err(Error::InvalidTimeFormat(value.to_string())),
    };
    NaiveTime::parse_from_str(value, format)
        .map_err(|_| Error::InvalidTimeFormat(value.to_string()))
}

/// Whole seconds from `now` until the next `kill_time`.
///
/// Zero means the kill time is the current second.
pub fn seconds_until(kill_time: NaiveTime, now: NaiveTime) -> u64 {
    let kill = i64::from(kill_time.num_seconds_from_midnight());
    let now = i64::from(now.num_seconds_from_midnight());
    (kill - now).rem_euclid(SECONDS_PER_DAY).unsigned_abs()
}

/// Sweep interval for the given limits, `None` when both are disabled.
pub fn sweep_interval(max_life_time: u64, max_idle_time: u64) -> Option<Duration> {
    let secs = match (max_life_time, max_idle_time) {
        (0, 0) => return None,
        (life, 0) => life,
        (0, idle) => idle,
        (life, idle) => life.min(idle),
    };
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy)]
enum GcJob {
    Sweep,
    DestroyAll,
}

impl fmt::Display for GcJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcJob::Sweep => write!(f, "SessionGC()"),
            GcJob::DestroyAll => write!(f, "DestroyAllSessions()"),
        }
    }
}

/// Owns the cancellation token of the currently running loops.
#[derive(Default)]
pub struct GcScheduler {
    token: Mutex<Option<CancellationToken>>,
}

impl GcScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the loops the provider's limits and `kill_time` call for.
    ///
    /// Loops from an earlier start are always cancelled. With no policy
    /// configured nothing new is spawned; otherwise the limits are read
    /// once: changing them later requires a stop and a new start. Must be
    /// called from within a Tokio runtime.
    pub fn start(
        &self,
        provider: Arc<dyn Provider>,
        kill_time: Option<NaiveTime>,
        log: LogSink,
    ) -> Result<GcState> {
        let interval = sweep_interval(provider.max_life_time(), provider.max_idle_time());
        if kill_time.is_none() && interval.is_none() {
            self.stop();
            debug!("No expiry policy configured, GC not started");
            return Ok(GcState::Stopped);
        }

        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let token = CancellationToken::new();
        if let Some(previous) = self.token.lock().replace(token.clone()) {
            previous.cancel();
        }

        if let Some(kill_time) = kill_time {
            runtime.spawn(kill_loop(
                Arc::clone(&provider),
                kill_time,
                log.clone(),
                token.clone(),
            ));
        }

        if let Some(interval) = interval {
            log.debug(format!(
                "running garbage collector every {} seconds",
                interval.as_secs()
            ));
            runtime.spawn(sweep_loop(provider, interval, log, token));
        }

        info!(?kill_time, ?interval, "Session GC started");
        Ok(GcState::Running)
    }

    /// Cancel the running loops. Stopping a stopped scheduler is a no-op.
    pub fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
            info!("Session GC stopped");
        }
    }

    pub fn state(&self) -> GcState {
        match self.token.lock().as_ref() {
            Some(token) if !token.is_cancelled() => GcState::Running,
            _ => GcState::Stopped,
        }
    }
}

impl Drop for GcScheduler {
    fn drop(&mut self) {
        if let Some(token) = self.token.get_mut().take() {
            token.cancel();
        }
    }
}

impl fmt::Debug for GcScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcScheduler")
            .field("state", &self.state())
            .finish()
    }
}

async fn kill_loop(
    provider: Arc<dyn Provider>,
    kill_time: NaiveTime,
    log: LogSink,
    token: CancellationToken,
) {
    loop {
        let wait = seconds_until(kill_time, Local::now().time());
        log.warn(format!("waiting session killer in {wait} seconds"));

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
        }

        log.debug(format!("calling {}", GcJob::DestroyAll));
        run_job(&provider, &log, GcJob::DestroyAll).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(KILL_SETTLE_DELAY) => {}
        }
    }
    debug!("Session kill loop exited");
}

async fn sweep_loop(
    provider: Arc<dyn Provider>,
    interval: Duration,
    log: LogSink,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        log.debug(format!("calling {}", GcJob::Sweep));
        run_job(&provider, &log, GcJob::Sweep).await;
    }
    debug!("Session sweep loop exited");
}

/// Run a provider call on the blocking pool. A panicking provider is
/// logged and the loop keeps going.
async fn run_job(provider: &Arc<dyn Provider>, log: &LogSink, job: GcJob) {
    let task_provider = Arc::clone(provider);
    let task_log = log.clone();
    let result = tokio::task::spawn_blocking(move || match job {
        GcJob::Sweep => task_provider.session_gc(&task_log),
        GcJob::DestroyAll => task_provider.destroy_all_sessions(&task_log),
    })
    .await;

    if let Err(e) = result {
        log.error(format!("{job} failed: {e}"));
    }
}
