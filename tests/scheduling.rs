//! Scheduler behavior: trigger instants, job execution, outputs.

mod common;

use chrono::{DateTime, Utc};

use common::{Harness, text_completion};
use loopgate::scheduler::types::{JobAction, Output, ScheduledJob, Trigger, next_fire};

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[test]
fn weekday_daily_trigger_created_on_saturday_fires_monday_berlin() {
    // Job: daily 08:00, Mon-Fri, Europe/Berlin; created Sat 2025-03-15 10:00Z.
    let trigger = Trigger::Daily {
        time: "08:00".into(),
        days: Some(vec![1, 2, 3, 4, 5]),
        tz: "Europe/Berlin".into(),
    };
    let next = next_fire(&trigger, utc("2025-03-15T10:00:00Z"))
        .unwrap()
        .unwrap();
    assert_eq!(next, utc("2025-03-17T07:00:00Z"));
}

#[tokio::test]
async fn due_job_runs_and_writes_file_output() {
    let harness = Harness::new(vec![text_completion("today: nothing urgent")]);

    let mut job = ScheduledJob::new(
        "Morning digest",
        Trigger::Interval { minutes: 60 },
        JobAction {
            prompt: "Digest for {{date}}".into(),
            tenant_id: None,
            max_iterations: None,
        },
        Output::File {
            path: "digests/morning.md".into(),
        },
    );
    job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    harness.db.insert_job(&job).unwrap();

    harness.scheduler.execute_job(job.id.clone()).await;

    let stored = harness.db.get_job(&job.id).unwrap().unwrap();
    assert_eq!(stored.last_status.as_deref(), Some("success"));
    assert_eq!(stored.run_count, 1);
    assert!(stored.next_run_at.unwrap() > Utc::now());

    let written = std::fs::read_to_string(
        harness.tmp.path().join("outputs/digests/morning.md"),
    )
    .unwrap();
    assert!(written.starts_with("# Morning digest"));
    assert!(written.contains("today: nothing urgent"));
}

#[tokio::test]
async fn run_rows_are_terminal_and_carry_tokens() {
    let harness = Harness::new(vec![text_completion("ran")]);
    let mut job = ScheduledJob::new(
        "Tick",
        Trigger::Interval { minutes: 60 },
        JobAction {
            prompt: "go".into(),
            tenant_id: None,
            max_iterations: None,
        },
        Output::Channel {
            channel_id: "cli".into(),
        },
    );
    job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    harness.db.insert_job(&job).unwrap();

    let mut rx = harness.events.subscribe();
    harness.scheduler.execute_job(job.id.clone()).await;

    let run_id = loop {
        let event = rx.recv().await.unwrap();
        if event.name == "scheduler:job:complete" {
            break event.payload["runId"].as_str().unwrap().to_string();
        }
    };
    let run = harness.db.get_job_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, loopgate::scheduler::RunStatus::Success);
    assert_eq!(run.input_tokens, 10);
    assert_eq!(run.output_tokens, 5);
    assert!(run.completed_at.is_some());

    // Terminal rows never return to running.
    assert!(
        !harness
            .db
            .finish_job_run(&run_id, loopgate::scheduler::RunStatus::Error, None, None, 0, 0)
            .unwrap()
    );
}

#[tokio::test]
async fn scheduler_conversation_is_stable_per_job() {
    let harness = Harness::new(vec![text_completion("first"), text_completion("second")]);
    let mut job = ScheduledJob::new(
        "Repeater",
        Trigger::Interval { minutes: 60 },
        JobAction {
            prompt: "again".into(),
            tenant_id: None,
            max_iterations: None,
        },
        Output::Channel {
            channel_id: "cli".into(),
        },
    );
    job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    harness.db.insert_job(&job).unwrap();

    harness.scheduler.execute_job(job.id.clone()).await;
    let mut job = harness.db.get_job(&job.id).unwrap().unwrap();
    job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    harness.db.update_job(&job).unwrap();
    harness.scheduler.execute_job(job.id.clone()).await;

    // Both runs share one synthetic conversation keyed job-<id>.
    let conversation = harness
        .db
        .get_or_create_conversation("scheduler", &format!("job-{}", job.id), None)
        .unwrap();
    let messages = harness
        .db
        .conversation_messages(conversation.id, 20)
        .unwrap();
    // Two user prompts + two assistant replies.
    assert_eq!(messages.len(), 4);
}
