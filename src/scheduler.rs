use std::future;
use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::discovery::Discovery;
use crate::error::Result;
use crate::health::HealthChecker;
use crate::manager::AppManager;
use crate::worker::TaskHandle;

const SECONDS_PER_DAY: u32 = 86_400;

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

/// Whether `at` falls inside `(now - window, now]`, wrapping at midnight.
pub fn due_in_window(at: NaiveTime, now: NaiveTime, window: Duration) -> bool {
    let window = window.as_secs().min(SECONDS_PER_DAY as u64) as u32;
    let now = now.num_seconds_from_midnight();
    let at = at.num_seconds_from_midnight();
    let elapsed = (now + SECONDS_PER_DAY - at) % SECONDS_PER_DAY;
    elapsed < window
}

#[derive(Debug, Default)]
pub struct TimeOfDayReport {
    pub restarted: Vec<i64>,
    pub updates: Vec<TaskHandle>,
}

/// Restarts and updates apps whose configured time fell in the last window.
/// Per-app failures are logged.
pub async fn run_time_of_day(
    manager: &AppManager,
    now: NaiveTime,
    window: Duration,
) -> Result<TimeOfDayReport> {
    let mut report = TimeOfDayReport::default();
    for app in manager.apps_with_containers().await? {
        if app.schedule_restart && is_due(app.restart_at.as_deref(), now, window, app.id) {
            match manager.restart(app.id).await {
                Ok(()) => {
                    info!(app_id = app.id, app = %app.name, "scheduled-restart");
                    report.restarted.push(app.id);
                }
                Err(err) => error!(
                    app_id = app.id,
                    app = %app.name,
                    code = err.code(),
                    error = %err,
                    "scheduled-restart-failed"
                ),
            }
        }
        if app.schedule_update && is_due(app.update_at.as_deref(), now, window, app.id) {
            match manager.update(app.id, true).await {
                Ok(handle) => {
                    info!(
                        app_id = app.id,
                        app = %app.name,
                        task_id = %handle.task_id,
                        "scheduled-update"
                    );
                    report.updates.push(handle);
                }
                Err(err) => error!(
                    app_id = app.id,
                    app = %app.name,
                    code = err.code(),
                    error = %err,
                    "scheduled-update-rejected"
                ),
            }
        }
    }
    Ok(report)
}

fn is_due(raw: Option<&str>, now: NaiveTime, window: Duration, app_id: i64) -> bool {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return false;
    };
    match parse_time_of_day(raw) {
        Some(at) => due_in_window(at, now, window),
        None => {
            warn!(app_id, value = raw, "schedule-time-invalid");
            false
        }
    }
}

/// Periods driving the long-running scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerPlan {
    pub health_interval: Duration,
    pub schedule_interval: Duration,
    pub discovery_interval: Option<Duration>,
    pub discover_on_startup: bool,
}

fn every(period: Duration, first_tick_now: bool) -> Interval {
    let start = if first_tick_now {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

/// Runs the health sweep, time-of-day schedules and discovery until
/// `max_iterations` ticks have been handled (forever when `None`).
pub async fn run_scheduler(
    manager: AppManager,
    health: HealthChecker,
    discovery: Option<Discovery>,
    plan: SchedulerPlan,
    max_iterations: Option<u64>,
) -> Result<()> {
    info!(
        health_interval_secs = plan.health_interval.as_secs(),
        schedule_interval_secs = plan.schedule_interval.as_secs(),
        discovery = discovery.is_some(),
        "scheduler-start"
    );
    if plan.discover_on_startup {
        if let Some(discovery) = &discovery {
            discover(&manager, discovery).await;
        }
    }

    let mut health_tick = every(plan.health_interval, true);
    let mut schedule_tick = every(plan.schedule_interval, true);
    let mut discovery_tick = match (&discovery, plan.discovery_interval) {
        (Some(_), Some(period)) => Some(every(period, false)),
        _ => None,
    };
    let mut iterations: u64 = 0;

    loop {
        tokio::select! {
            _ = health_tick.tick() => {
                match health.sweep().await {
                    Ok(report) => info!(
                        succeeded = report.succeeded.len(),
                        failed = report.failed.len(),
                        pending = report.pending.len(),
                        rollbacks = report.rollbacks.len(),
                        "health-sweep"
                    ),
                    Err(err) => error!(code = err.code(), error = %err, "health-sweep-failed"),
                }
            }
            _ = schedule_tick.tick() => {
                let now = Local::now().time();
                if let Err(err) = run_time_of_day(&manager, now, plan.schedule_interval).await {
                    error!(code = err.code(), error = %err, "schedule-tick-failed");
                }
            }
            _ = tick_optional(&mut discovery_tick) => {
                if let Some(discovery) = &discovery {
                    discover(&manager, discovery).await;
                }
            }
        }

        iterations = iterations.saturating_add(1);
        if let Some(limit) = max_iterations {
            if iterations >= limit {
                info!(iterations, "scheduler-stop max iterations reached");
                return Ok(());
            }
        }
    }
}

async fn discover(manager: &AppManager, discovery: &Discovery) {
    match discovery.register(manager).await {
        Ok(apps) => info!(registered = apps.len(), "discovery-pass"),
        Err(err) => error!(code = err.code(), error = %err, "discovery-failed"),
    }
}
