//! Durable job engine: computes next fires, executes due jobs through the
//! agent loop, routes outputs and records runs. Runs of one job are
//! serialized; distinct jobs execute concurrently.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::output::OutputRouter;
use super::types::{JobRun, RunStatus, ScheduledJob, Trigger, next_fire};
use crate::agent::AgentEngine;
use crate::errors::GatewayError;
use crate::events::{EventBus, names};
use crate::store::Database;

const IDLE_POLL_SECS: u64 = 30;
const MIN_SLEEP_MS: u64 = 500;
const RUN_RETENTION_DAYS: i64 = 90;

/// Synthetic channel scheduled runs converse under.
pub const SCHEDULER_CHANNEL: &str = "scheduler";

#[derive(Clone)]
pub struct Scheduler {
    db: Arc<Database>,
    engine: Arc<AgentEngine>,
    router: Arc<OutputRouter>,
    events: EventBus,
    tz: Tz,
    cancel: CancellationToken,
    /// Jobs currently executing; guards against overlapping runs.
    active: Arc<StdMutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        engine: Arc<AgentEngine>,
        router: Arc<OutputRouter>,
        events: EventBus,
        tz: Tz,
    ) -> Self {
        Self {
            db,
            engine,
            router,
            events,
            tz,
            cancel: CancellationToken::new(),
            active: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Validate the trigger, compute the first fire and persist. An
    /// invalid trigger persists the job disabled with `lastStatus=error`
    /// and surfaces `SchedulerConfig`.
    pub fn create_job(&self, mut job: ScheduledJob) -> Result<ScheduledJob, GatewayError> {
        match next_fire(&job.trigger, Utc::now()) {
            Ok(next) => {
                job.next_run_at = next;
                self.db.insert_job(&job).map_err(GatewayError::Internal)?;
                Ok(job)
            }
            Err(e) => {
                job.enabled = false;
                job.last_status = Some("error".into());
                job.next_run_at = None;
                self.db.insert_job(&job).map_err(GatewayError::Internal)?;
                Err(e)
            }
        }
    }

    /// Enable or disable; `next_run_at` is recomputed on every toggle.
    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<(), GatewayError> {
        let Some(mut job) = self.db.get_job(job_id).map_err(GatewayError::Internal)? else {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "unknown job '{job_id}'"
            )));
        };
        job.enabled = enabled;
        job.next_run_at = if enabled {
            match job.trigger {
                Trigger::CalendarEvent { .. } => self
                    .db
                    .next_calendar_fire(job_id)
                    .map_err(GatewayError::Internal)?,
                _ => next_fire(&job.trigger, Utc::now())?,
            }
        } else {
            None
        };
        self.db.update_job(&job).map_err(GatewayError::Internal)?;
        Ok(())
    }

    /// Replace trigger/action/output; recomputes the next fire.
    pub fn update_job(&self, mut job: ScheduledJob) -> Result<ScheduledJob, GatewayError> {
        if job.enabled {
            job.next_run_at = match job.trigger {
                Trigger::CalendarEvent { .. } => self
                    .db
                    .next_calendar_fire(&job.id)
                    .map_err(GatewayError::Internal)?,
                _ => next_fire(&job.trigger, Utc::now())?,
            };
        }
        self.db.update_job(&job).map_err(GatewayError::Internal)?;
        Ok(job)
    }

    /// Recompute every enabled job's next fire; used at boot so stale
    /// persisted values never block firing.
    pub fn recompute_all(&self) -> Result<(), GatewayError> {
        for mut job in self.db.list_jobs(true).map_err(GatewayError::Internal)? {
            let next = match job.trigger {
                Trigger::CalendarEvent { .. } => self
                    .db
                    .next_calendar_fire(&job.id)
                    .map_err(GatewayError::Internal)?,
                _ => match next_fire(&job.trigger, Utc::now()) {
                    Ok(next) => next,
                    Err(e) => {
                        warn!("job '{}' has an invalid trigger, disabling: {}", job.id, e);
                        job.enabled = false;
                        job.last_status = Some("error".into());
                        None
                    }
                },
            };
            // A once-trigger that came due while we were down fires now.
            job.next_run_at = next;
            self.db.update_job(&job).map_err(GatewayError::Internal)?;
        }
        Ok(())
    }

    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("scheduler started");
            loop {
                tokio::select! {
                    () = scheduler.cancel.cancelled() => break,
                    () = scheduler.tick_and_sleep() => {}
                }
            }
            info!("scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn tick_and_sleep(&self) {
        self.tick().await;

        let sleep_ms = match self.db.earliest_next_run() {
            Ok(Some(next)) => {
                let delta = next - Utc::now();
                delta
                    .num_milliseconds()
                    .clamp(MIN_SLEEP_MS as i64, (IDLE_POLL_SECS * 1000) as i64) as u64
            }
            _ => IDLE_POLL_SECS * 1000,
        };
        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
    }

    pub(crate) async fn tick(&self) {
        let due = match self.db.due_jobs(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                error!("scheduler tick query failed: {e:#}");
                return;
            }
        };
        for job in due {
            let claimed = {
                let mut active = self
                    .active
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                active.insert(job.id.clone())
            };
            if !claimed {
                // The previous run of this job is still going.
                continue;
            }
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.execute_job(job.id.clone()).await;
                scheduler
                    .active
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&job.id);
            });
        }
    }

    /// Execute one due job end to end. Public for tests and the webhook
    /// `task` entry point.
    pub async fn execute_job(&self, job_id: String) {
        // Re-check enabled at fire time.
        let job = match self.db.get_job(&job_id) {
            Ok(Some(job)) if job.enabled => job,
            Ok(_) => return,
            Err(e) => {
                error!("cannot load job '{job_id}': {e:#}");
                return;
            }
        };

        match job.trigger {
            Trigger::CalendarEvent { .. } => self.execute_calendar_job(job).await,
            _ => self.execute_plain_job(job).await,
        }
    }

    async fn execute_plain_job(&self, mut job: ScheduledJob) {
        let now = Utc::now();
        // Advance before executing so the job cannot re-fire mid-run.
        job.last_run_at = Some(now);
        job.run_count += 1;
        job.next_run_at = match job.trigger {
            Trigger::Once { .. } => None,
            _ => next_fire(&job.trigger, now).ok().flatten(),
        };
        if matches!(job.trigger, Trigger::Once { .. }) {
            job.enabled = false;
        }
        job.last_status = Some("running".into());
        if let Err(e) = self.db.update_job(&job) {
            error!("cannot persist job '{}' before run: {e:#}", job.id);
            return;
        }

        let status = self.run_once(&job, None).await;
        self.finalize(job, status).await;
    }

    async fn execute_calendar_job(&self, mut job: ScheduledJob) {
        let now = Utc::now();
        let fires = match self.db.due_calendar_fires(&job.id, now) {
            Ok(fires) => fires,
            Err(e) => {
                error!("cannot load calendar fires for '{}': {e:#}", job.id);
                return;
            }
        };
        if fires.is_empty() {
            // next_run_at pointed at nothing; resync it.
            job.next_run_at = self.db.next_calendar_fire(&job.id).ok().flatten();
            let _ = self.db.update_job(&job);
            return;
        }

        let mut last_status = RunStatus::Success;
        for fire in fires {
            job.last_run_at = Some(Utc::now());
            job.run_count += 1;
            let status = self.run_once(&job, Some(&fire.event_title)).await;
            if status == RunStatus::Error {
                last_status = RunStatus::Error;
            }
            if let Err(e) =
                self.db
                    .mark_calendar_fire_done(&fire.job_id, &fire.event_uid, fire.occurrence_start)
            {
                warn!("cannot mark calendar fire done: {e:#}");
            }
        }

        job.next_run_at = self.db.next_calendar_fire(&job.id).ok().flatten();
        self.finalize(job, last_status).await;
    }

    async fn finalize(&self, mut job: ScheduledJob, status: RunStatus) {
        job.last_status = Some(status.as_str().to_string());
        if job.delete_after_run {
            if let Err(e) = self.db.delete_job(&job.id) {
                warn!("cannot delete one-shot job '{}': {e:#}", job.id);
            }
            return;
        }
        if let Err(e) = self.db.update_job(&job) {
            error!("cannot persist job '{}' after run: {e:#}", job.id);
        }
    }

    /// One run: JobRun row, prompt templating, synthetic conversation,
    /// agent loop, output routing.
    async fn run_once(&self, job: &ScheduledJob, event_title: Option<&str>) -> RunStatus {
        let run = JobRun {
            id: format!("run-{}", Uuid::new_v4()),
            job_id: job.id.clone(),
            status: RunStatus::Running,
            output: None,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            started_at: Utc::now(),
            completed_at: None,
        };
        if let Err(e) = self.db.insert_job_run(&run) {
            error!("cannot record run for job '{}': {e:#}", job.id);
            return RunStatus::Error;
        }
        let _ = self
            .db
            .prune_job_runs(Utc::now() - chrono::Duration::days(RUN_RETENTION_DAYS));

        let prompt = render_prompt(&job.action.prompt, Utc::now().with_timezone(&self.tz), event_title);

        let result: Result<_, GatewayError> = async {
            let conversation = self
                .db
                .get_or_create_conversation(
                    SCHEDULER_CHANNEL,
                    &format!("job-{}", job.id),
                    Some(&job.name),
                )
                .map_err(GatewayError::Internal)?;
            let mut config = self
                .engine
                .resolver()
                .resolve(job.action.tenant_id.as_deref())
                .map_err(GatewayError::Internal)?;
            if let Some(max_iterations) = job.action.max_iterations {
                config.max_iterations = max_iterations;
            }
            self.engine
                .run(
                    conversation.id,
                    &prompt,
                    &config,
                    self.cancel.child_token(),
                )
                .await
        }
        .await;

        match result {
            Ok(outcome) => {
                if let Err(e) = self.db.finish_job_run(
                    &run.id,
                    RunStatus::Success,
                    Some(&outcome.text),
                    None,
                    outcome.input_tokens,
                    outcome.output_tokens,
                ) {
                    warn!("cannot finish run {}: {e:#}", run.id);
                }
                if let Err(e) = self.router.route(job, &outcome.text).await {
                    warn!("job '{}' output routing failed: {e:#}", job.name);
                }
                self.events.emit(
                    names::SCHEDULER_JOB_COMPLETE,
                    json!({
                        "jobId": job.id,
                        "jobName": job.name,
                        "runId": run.id,
                        "inputTokens": outcome.input_tokens,
                        "outputTokens": outcome.output_tokens,
                    }),
                    job.action.tenant_id.clone(),
                );
                info!("job '{}' completed", job.name);
                RunStatus::Success
            }
            Err(e) => {
                if let Err(persist_err) = self.db.finish_job_run(
                    &run.id,
                    RunStatus::Error,
                    None,
                    Some(&e.to_string()),
                    0,
                    0,
                ) {
                    warn!("cannot finish run {}: {persist_err:#}", run.id);
                }
                self.events.emit(
                    names::TASK_ERROR,
                    json!({"jobId": job.id, "jobName": job.name, "error": e.to_string()}),
                    job.action.tenant_id.clone(),
                );
                error!("job '{}' failed: {e}", job.name);
                RunStatus::Error
            }
        }
    }
}

/// Substitute `{{date}}`, `{{time}}`, `{{datetime}}` and (for calendar
/// triggers) `{{event_title}}`.
pub fn render_prompt(
    template: &str,
    now: DateTime<Tz>,
    event_title: Option<&str>,
) -> String {
    template
        .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{time}}", &now.format("%H:%M").to_string())
        .replace("{{datetime}}", &now.format("%Y-%m-%d %H:%M").to_string())
        .replace("{{event_title}}", event_title.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::engine::tests::{ScriptedProvider, engine_with, text_completion};
    use crate::scheduler::output::{LoggingChannelSink, NoEmailSender};
    use crate::scheduler::types::{JobAction, Output};
    use crate::store::calendar::CalendarFire;
    use chrono::TimeZone;

    fn scheduler_with(
        provider: Arc<ScriptedProvider>,
    ) -> (Arc<Database>, Arc<Scheduler>, EventBus) {
        let (db, engine) = engine_with(provider);
        let events = EventBus::default();
        let tmp = std::env::temp_dir().join(format!("loopgate-test-{}", Uuid::new_v4()));
        let router = Arc::new(OutputRouter::new(
            Arc::new(LoggingChannelSink),
            Arc::new(NoEmailSender),
            tmp,
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            Arc::new(engine),
            router,
            events.clone(),
            chrono_tz::UTC,
        ));
        (db, scheduler, events)
    }

    fn interval_job(minutes: u32) -> ScheduledJob {
        ScheduledJob::new(
            "Tick",
            Trigger::Interval { minutes },
            JobAction {
                prompt: "Report for {{date}}".into(),
                tenant_id: None,
                max_iterations: None,
            },
            Output::Channel {
                channel_id: "cli".into(),
            },
        )
    }

    #[test]
    fn test_render_prompt_substitutions() {
        let now = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 4, 1, 8, 45, 0)
            .unwrap();
        let rendered = render_prompt(
            "On {{date}} at {{time}} ({{datetime}}): {{event_title}}",
            now,
            Some("Invoice Day"),
        );
        assert_eq!(
            rendered,
            "On 2025-04-01 at 08:45 (2025-04-01 08:45): Invoice Day"
        );
    }

    #[tokio::test]
    async fn test_create_job_computes_first_fire() {
        let provider = ScriptedProvider::new(vec![]);
        let (db, scheduler, _events) = scheduler_with(provider);
        let created = scheduler.create_job(interval_job(30)).unwrap();
        assert!(created.next_run_at.unwrap() > Utc::now());
        assert!(db.get_job(&created.id).unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_create_job_invalid_trigger_disables() {
        let provider = ScriptedProvider::new(vec![]);
        let (db, scheduler, _events) = scheduler_with(provider);
        let mut job = interval_job(30);
        job.trigger = Trigger::Daily {
            time: "99:99".into(),
            days: None,
            tz: "UTC".into(),
        };
        let id = job.id.clone();
        let err = scheduler.create_job(job).unwrap_err();
        assert!(matches!(err, GatewayError::SchedulerConfig(_)));

        let stored = db.get_job(&id).unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.last_status.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_execute_advances_and_records_run() {
        let provider = ScriptedProvider::new(vec![text_completion("daily summary")]);
        let (db, scheduler, events) = scheduler_with(provider);
        let mut rx = events.subscribe();

        let mut job = interval_job(60);
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        db.insert_job(&job).unwrap();

        scheduler.execute_job(job.id.clone()).await;

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_status.as_deref(), Some("success"));
        assert!(stored.next_run_at.unwrap() > Utc::now());

        // The run row is terminal with the output captured.
        let event = loop {
            let event = rx.recv().await.unwrap();
            if event.name == names::SCHEDULER_JOB_COMPLETE {
                break event;
            }
        };
        let run_id = event.payload["runId"].as_str().unwrap();
        let run = db.get_job_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output.as_deref(), Some("daily summary"));

        // The synthetic conversation exists under the scheduler channel.
        let conversation = db
            .get_or_create_conversation(SCHEDULER_CHANNEL, &format!("job-{}", job.id), None)
            .unwrap();
        let messages = db.conversation_messages(conversation.id, 10).unwrap();
        assert!(messages[0].content.starts_with("Report for 20"));
    }

    #[tokio::test]
    async fn test_once_job_disables_after_run() {
        let provider = ScriptedProvider::new(vec![text_completion("done")]);
        let (db, scheduler, _events) = scheduler_with(provider);

        let mut job = interval_job(1);
        job.trigger = Trigger::Once {
            run_at: Utc::now() - chrono::Duration::seconds(5),
        };
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(5));
        db.insert_job(&job).unwrap();

        scheduler.execute_job(job.id.clone()).await;

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert!(!stored.enabled);
        assert!(stored.next_run_at.is_none());
        assert_eq!(stored.run_count, 1);
    }

    #[tokio::test]
    async fn test_disabled_job_not_executed() {
        let provider = ScriptedProvider::new(vec![text_completion("nope")]);
        let (db, scheduler, _events) = scheduler_with(provider.clone());

        let mut job = interval_job(60);
        job.enabled = false;
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        db.insert_job(&job).unwrap();

        scheduler.execute_job(job.id.clone()).await;
        assert_eq!(
            provider.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(db.get_job(&job.id).unwrap().unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn test_provider_failure_records_error() {
        // Empty script: provider errors on first call.
        let provider = ScriptedProvider::new(vec![]);
        let (db, scheduler, events) = scheduler_with(provider);
        let mut rx = events.subscribe();

        let mut job = interval_job(60);
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        db.insert_job(&job).unwrap();

        scheduler.execute_job(job.id.clone()).await;

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.last_status.as_deref(), Some("error"));
        // Still advanced; a failing job must not re-fire in a tight loop.
        assert!(stored.next_run_at.unwrap() > Utc::now());

        let event = loop {
            let event = rx.recv().await.unwrap();
            if event.name == names::TASK_ERROR {
                break event;
            }
        };
        assert_eq!(event.payload["jobId"], job.id);
    }

    #[tokio::test]
    async fn test_calendar_job_runs_due_fires_with_event_title() {
        let provider = ScriptedProvider::new(vec![text_completion("invoice handled")]);
        let (db, scheduler, _events) = scheduler_with(provider);

        let mut job = interval_job(1);
        job.trigger = Trigger::CalendarEvent {
            calendar_id: "cal-1".into(),
            minutes_before: Some(15),
            minutes_after: None,
            title_filter: Some("invoice".into()),
        };
        job.action.prompt = "Prepare: {{event_title}}".into();
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        db.insert_job(&job).unwrap();

        let occurrence = Utc::now() + chrono::Duration::minutes(10);
        db.arm_calendar_fire(&CalendarFire {
            job_id: job.id.clone(),
            event_uid: "E1".into(),
            occurrence_start: occurrence,
            event_title: "Invoice Day".into(),
            fire_at: Utc::now() - chrono::Duration::seconds(1),
        })
        .unwrap();

        scheduler.execute_job(job.id.clone()).await;

        // Prompt carried the substituted title.
        let conversation = db
            .get_or_create_conversation(SCHEDULER_CHANNEL, &format!("job-{}", job.id), None)
            .unwrap();
        let messages = db.conversation_messages(conversation.id, 10).unwrap();
        assert_eq!(messages[0].content, "Prepare: Invoice Day");

        // The fire is consumed; no pending fires remain.
        assert!(db.due_calendar_fires(&job.id, Utc::now()).unwrap().is_empty());
        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert!(stored.next_run_at.is_none());
        assert_eq!(stored.run_count, 1);
    }

    #[tokio::test]
    async fn test_tick_claims_job_once() {
        let provider = ScriptedProvider::new(vec![text_completion("a"), text_completion("b")]);
        let (db, scheduler, _events) = scheduler_with(provider);

        let mut job = interval_job(60);
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        db.insert_job(&job).unwrap();

        // Two immediate ticks: the second must not double-claim.
        scheduler.tick().await;
        scheduler.tick().await;
        // Allow the spawned run to finish.
        for _ in 0..200 {
            if db.get_job(&job.id).unwrap().unwrap().run_count > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(db.get_job(&job.id).unwrap().unwrap().run_count, 1);
    }
}
