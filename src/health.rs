use tracing::{error, info, warn};

use crate::config::HealthPolicy;
use crate::current_unix_millis;
use crate::error::Result;
use crate::manager::AppManager;
use crate::model::{Application, UpdateHistoryRecord, UpdateState};
use crate::worker::TaskHandle;

enum Verdict {
    /// Another instance owns the app.
    Skip,
    Pending,
    Success,
    Fail(Option<Application>),
}

/// Outcome of one sweep, by history record id.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub succeeded: Vec<i64>,
    pub failed: Vec<i64>,
    pub pending: Vec<i64>,
    /// Owned by another endpoint, or superseded before it could be settled.
    pub skipped: Vec<i64>,
    /// Rollbacks started for failed records.
    pub rollbacks: Vec<TaskHandle>,
}

/// Promotes `Checking` records to `Success` or `Fail` from container uptime.
#[derive(Clone)]
pub struct HealthChecker {
    manager: AppManager,
    policy: HealthPolicy,
}

impl HealthChecker {
    pub fn new(manager: AppManager, policy: HealthPolicy) -> Self {
        Self { manager, policy }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(current_unix_millis()).await
    }

    /// Per-record failures are logged and do not stop the sweep.
    pub async fn sweep_at(&self, now: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let store = self.manager.store();
        for record in store.list_history_by_state(UpdateState::Checking).await? {
            let verdict = self.evaluate(&record, now).await;
            if let Err(err) = self.settle(&record, verdict, &mut report).await {
                error!(
                    history_id = record.id,
                    app_id = record.app_id,
                    code = err.code(),
                    error = %err,
                    "health-check-record-failed"
                );
            }
        }
        Ok(report)
    }

    async fn evaluate(&self, record: &UpdateHistoryRecord, now: i64) -> Verdict {
        let app = match self.manager.store().get_app(record.app_id).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                warn!(history_id = record.id, app_id = record.app_id, "health-app-missing");
                return Verdict::Fail(None);
            }
            Err(err) => {
                error!(history_id = record.id, error = %err, "health-app-load-failed");
                return Verdict::Pending;
            }
        };
        if app.endpoint.as_deref() != self.manager.endpoint() {
            return Verdict::Skip;
        }
        let Some(container) = app.bound_container() else {
            warn!(app_id = app.id, app = %app.name, "health-container-unbound");
            return Verdict::Fail(Some(app));
        };
        let state = match self.manager.runtime().inspect(container).await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    app_id = app.id,
                    app = %app.name,
                    kind = err.kind(),
                    error = %err,
                    "health-inspect-failed"
                );
                return Verdict::Fail(Some(app));
            }
        };

        let success_cutoff = now - self.policy.success_grace.as_millis() as i64;
        let failure_cutoff = now - self.policy.failure_grace.as_millis() as i64;
        info!(
            app_id = app.id,
            app = %app.name,
            running = state.running,
            started_at = ?state.started_at,
            updated_at = record.updated_at,
            "health-checking"
        );
        let up_long_enough = state.running
            && state.started_at.is_some_and(|t| t < success_cutoff)
            && record.updated_at < success_cutoff;
        if up_long_enough {
            Verdict::Success
        } else if record.updated_at < failure_cutoff {
            Verdict::Fail(Some(app))
        } else {
            Verdict::Pending
        }
    }

    async fn settle(
        &self,
        record: &UpdateHistoryRecord,
        verdict: Verdict,
        report: &mut SweepReport,
    ) -> Result<()> {
        let history = self.manager.history();
        match verdict {
            Verdict::Skip => report.skipped.push(record.id),
            Verdict::Pending => report.pending.push(record.id),
            Verdict::Success => {
                if !history.mark(record, UpdateState::Success).await? {
                    superseded(record, report);
                    return Ok(());
                }
                info!(history_id = record.id, app_id = record.app_id, "update-confirmed");
                report.succeeded.push(record.id);
                history.prune(record.app_id, self.policy.retention).await?;
            }
            Verdict::Fail(app) => {
                if !history.mark(record, UpdateState::Fail).await? {
                    superseded(record, report);
                    return Ok(());
                }
                warn!(history_id = record.id, app_id = record.app_id, "update-failed");
                report.failed.push(record.id);
                if let Some(app) = app.filter(Application::wants_rollback) {
                    if let Some(handle) = self.auto_rollback(&app).await? {
                        report.rollbacks.push(handle);
                    }
                }
            }
        }
        Ok(())
    }

    async fn auto_rollback(&self, app: &Application) -> Result<Option<TaskHandle>> {
        let Some(target) = self.manager.history().latest_eligible_success(app.id).await? else {
            warn!(app_id = app.id, app = %app.name, "rollback-impossible no eligible backup");
            return Ok(None);
        };
        warn!(app_id = app.id, app = %app.name, history_id = target.id, "auto-rollback-start");
        match self.manager.rollback(app.id, target.id).await {
            Ok(handle) => Ok(Some(handle)),
            Err(err) => {
                warn!(
                    app_id = app.id,
                    app = %app.name,
                    code = err.code(),
                    error = %err,
                    "auto-rollback-rejected"
                );
                Ok(None)
            }
        }
    }
}

fn superseded(record: &UpdateHistoryRecord, report: &mut SweepReport) {
    info!(
        history_id = record.id,
        app_id = record.app_id,
        "health-record-superseded by a newer update"
    );
    report.skipped.push(record.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::md5_hex;
    use crate::container::ContainerState;
    use crate::lock::LockRegistry;
    use crate::testing::{RuntimeCall, TestContext};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    const MINUTE: i64 = 60_000;

    fn checker(ctx: &TestContext) -> HealthChecker {
        HealthChecker::new(ctx.manager.clone(), HealthPolicy::default())
    }

    fn stopped() -> ContainerState {
        ContainerState {
            running: false,
            started_at: None,
        }
    }

    async fn checking_record(ctx: &TestContext, app_id: i64) -> UpdateHistoryRecord {
        ctx.store
            .list_history_by_state(UpdateState::Checking)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.app_id == app_id)
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_update_rolls_back_to_last_success() {
        let ctx = TestContext::new(None).await;
        let mut app = ctx.raw_app("svc", b"v1", true).await;
        app.auto_rollback = Some(true);
        ctx.store.save_app(&app).await.unwrap();
        ctx.manager
            .update_from_upload(app.id, b"v2-broken".to_vec(), "svc.jar")
            .await
            .unwrap();
        let pending = checking_record(&ctx, app.id).await;
        ctx.runtime.set_state("c-svc", stopped());
        ctx.runtime.clear_calls();

        let report = checker(&ctx)
            .sweep_at(pending.updated_at + 11 * MINUTE)
            .await
            .unwrap();
        assert_eq!(report.failed, vec![pending.id]);
        assert_eq!(report.rollbacks.len(), 1);
        for handle in report.rollbacks {
            handle.wait().await.unwrap();
        }

        let record = ctx.store.get_history(pending.id).await.unwrap().unwrap();
        assert_eq!(record.state, UpdateState::Fail);
        assert_eq!(fs::read(ctx.local_path(&app)).unwrap(), b"v1");
        assert!(ctx.runtime.calls().contains(&RuntimeCall::Restart("c-svc".into())));
        let stored = ctx.store.require_app(app.id).await.unwrap();
        assert_eq!(stored.checksum, Some(md5_hex(b"v1")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retention_holds_after_repeated_successes() {
        let ctx = TestContext::new(None).await;
        let app = ctx.raw_app("svc", b"v0", false).await;
        let checker = checker(&ctx);
        let mut backups = Vec::new();

        for i in 1..=5 {
            ctx.manager
                .update_from_upload(app.id, format!("v{i}").into_bytes(), "svc.jar")
                .await
                .unwrap();
            let pending = checking_record(&ctx, app.id).await;
            ctx.runtime.set_state("c-svc", ctx.running_since(0));
            let report = checker
                .sweep_at(pending.updated_at + 6 * MINUTE)
                .await
                .unwrap();
            assert_eq!(report.succeeded, vec![pending.id]);
            backups.extend(
                ctx.store
                    .list_history_by_app(app.id)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter_map(|r| r.backup_path),
            );
        }

        let records = ctx.store.list_history_by_app(app.id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.state == UpdateState::Success));
        let live: Vec<&str> = records.iter().filter_map(|r| r.backup_path.as_deref()).collect();
        for path in backups.iter() {
            assert_eq!(Path::new(path).exists(), live.contains(&path.as_str()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn superseded_record_is_not_resurrected_or_counted() {
        let ctx = TestContext::new(None).await;
        let app = ctx.raw_app("svc", b"v0", false).await;
        let checker = checker(&ctx);
        ctx.runtime.set_state("c-svc", ctx.running_since(0));
        for i in 1..=3 {
            ctx.manager
                .update_from_upload(app.id, format!("v{i}").into_bytes(), "svc.jar")
                .await
                .unwrap();
            let pending = checking_record(&ctx, app.id).await;
            checker
                .sweep_at(pending.updated_at + 6 * MINUTE)
                .await
                .unwrap();
        }

        ctx.manager
            .update_from_upload(app.id, b"v4".to_vec(), "svc.jar")
            .await
            .unwrap();
        let stale = checking_record(&ctx, app.id).await;
        // A newer update lands between reading the record and settling it.
        ctx.manager
            .update_from_upload(app.id, b"v5".to_vec(), "svc.jar")
            .await
            .unwrap();

        for verdict in [Verdict::Success, Verdict::Fail(Some(app.clone()))] {
            let mut report = SweepReport::default();
            checker.settle(&stale, verdict, &mut report).await.unwrap();
            assert_eq!(report.skipped, vec![stale.id]);
            assert!(report.succeeded.is_empty() && report.failed.is_empty());
            assert!(report.rollbacks.is_empty());
        }

        assert!(ctx.store.get_history(stale.id).await.unwrap().is_none());
        let history = ctx.manager.history().list_history(app.id).await.unwrap();
        let eligible_successes = history
            .iter()
            .filter(|v| v.record.state == UpdateState::Success && v.rollback_eligible)
            .count();
        assert_eq!(eligible_successes, 3);
        assert_eq!(fs::read(ctx.local_path(&app)).unwrap(), b"v5");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recent_restart_stays_pending() {
        let ctx = TestContext::new(None).await;
        let app = ctx.raw_app("svc", b"v1", false).await;
        ctx.manager
            .update_from_upload(app.id, b"v2".to_vec(), "svc.jar")
            .await
            .unwrap();
        let pending = checking_record(&ctx, app.id).await;
        // Running, but restarted two minutes ago.
        ctx.runtime
            .set_state("c-svc", ctx.running_since(pending.updated_at + 4 * MINUTE));

        let report = checker(&ctx)
            .sweep_at(pending.updated_at + 6 * MINUTE)
            .await
            .unwrap();
        assert_eq!(report.pending, vec![pending.id]);
        assert_eq!(
            ctx.store.get_history(pending.id).await.unwrap().unwrap().state,
            UpdateState::Checking
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_endpoint_is_skipped() {
        let ctx = TestContext::new(None).await;
        let app = ctx.raw_app("svc", b"v1", false).await;
        ctx.manager
            .update_from_upload(app.id, b"v2".to_vec(), "svc.jar")
            .await
            .unwrap();
        let mut moved = ctx.store.require_app(app.id).await.unwrap();
        moved.endpoint = Some("node-b".into());
        ctx.store.save_app(&moved).await.unwrap();
        let pending = checking_record(&ctx, app.id).await;

        let report = checker(&ctx)
            .sweep_at(pending.updated_at + 60 * MINUTE)
            .await
            .unwrap();
        assert_eq!(report.skipped, vec![pending.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_app_or_container_fails_without_rollback() {
        let ctx = TestContext::new(None).await;
        let gone = ctx.raw_app("gone", b"v1", false).await;
        let lost = ctx.raw_app("lost", b"v1", false).await;
        let mut opted_out = lost.clone();
        opted_out.auto_rollback = Some(false);
        ctx.store.save_app(&opted_out).await.unwrap();
        for app in [&gone, &lost] {
            ctx.manager
                .update_from_upload(app.id, b"v2".to_vec(), "x.jar")
                .await
                .unwrap();
        }
        ctx.store.delete_app(gone.id).await.unwrap();
        let lost_record = checking_record(&ctx, lost.id).await;
        ctx.runtime.set_state("c-lost", stopped());

        let report = checker(&ctx)
            .sweep_at(lost_record.updated_at + 11 * MINUTE)
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(report.rollbacks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_app_is_not_rolled_back_concurrently() {
        let ctx = TestContext::new(None).await;
        let app = ctx.raw_app("svc", b"v1", false).await;
        ctx.manager
            .update_from_upload(app.id, b"v2".to_vec(), "svc.jar")
            .await
            .unwrap();
        let pending = checking_record(&ctx, app.id).await;
        ctx.runtime.set_state("c-svc", stopped());
        let _held = ctx.manager.locks().try_acquire(app.id, "manual-update").await.unwrap();

        let report = checker(&ctx)
            .sweep_at(pending.updated_at + 11 * MINUTE)
            .await
            .unwrap();
        assert_eq!(report.failed, vec![pending.id]);
        assert!(report.rollbacks.is_empty());
        assert_eq!(fs::read(ctx.local_path(&app)).unwrap(), b"v2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn app_held_by_another_process_is_not_rolled_back() {
        let ctx = TestContext::new(None).await;
        let app = ctx.raw_app("svc", b"v1", false).await;
        ctx.manager
            .update_from_upload(app.id, b"v2".to_vec(), "svc.jar")
            .await
            .unwrap();
        let pending = checking_record(&ctx, app.id).await;
        ctx.runtime.set_state("c-svc", stopped());
        let cli = LockRegistry::shared(ctx.store.clone(), Duration::from_secs(60));
        let held = cli.try_acquire(app.id, "manual-update").await.unwrap();

        let report = checker(&ctx)
            .sweep_at(pending.updated_at + 11 * MINUTE)
            .await
            .unwrap();
        assert_eq!(report.failed, vec![pending.id]);
        assert!(report.rollbacks.is_empty());
        assert_eq!(fs::read(ctx.local_path(&app)).unwrap(), b"v2");
        held.release().await;
    }

    #[test]
    fn default_policy_matches_grace_windows() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.success_grace, Duration::from_secs(300));
        assert_eq!(policy.failure_grace, Duration::from_secs(600));
        assert_eq!(policy.retention, 3);
    }
}
