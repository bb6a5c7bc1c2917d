mod common;

use chrono::Duration;
use common::*;
use nudge_core::{ChannelKind, QueueStatus, ReplyOutcome, ReplyResolution};
use tracing_test::traced_test;

#[tokio::test]
async fn sweep_sends_one_reminder_per_user() {
    let h = harness(&[2, 0, -1]);
    let aiko = h.user("aiko");
    let ben = h.user("ben");
    h.task("Deck", Some(due_in(0)), &[aiko]);
    h.task("Budget", Some(due_in(2)), &[aiko]);
    h.task("Audit", Some(due_in(-1)), &[ben]);

    let report = h.engine.run_daily_sweep(h.company, now()).await.unwrap();

    assert_eq!(report.candidates, 3);
    assert_eq!(report.created, 3);
    assert_eq!(report.dispatched, 2);
    assert!(report.failed_users.is_empty());
    assert_eq!(h.awaiting_count(aiko), 1);
    assert_eq!(h.awaiting_count(ben), 1);
    assert_eq!(
        h.statuses(aiko),
        vec![QueueStatus::AwaitingReply, QueueStatus::Waiting]
    );

    // Intro then the first reminder, nothing else.
    let texts = h.slack.texts_to(&slack_addr("aiko"));
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("aiko"));
    assert!(texts[1].contains("Deck") && texts[1].contains("due today"));
}

#[tokio::test]
async fn rerunning_the_sweep_is_a_no_op() {
    let h = harness(&[2, 0, -1]);
    let aiko = h.user("aiko");
    h.task("Deck", Some(due_in(0)), &[aiko]);
    h.task("Budget", Some(due_in(2)), &[aiko]);

    h.engine.run_daily_sweep(h.company, now()).await.unwrap();
    let later = now() + Duration::hours(3);
    let second = h.engine.run_daily_sweep(h.company, later).await.unwrap();

    assert_eq!(second.candidates, 2);
    assert_eq!(second.created, 0);
    assert_eq!(second.dispatched, 0);
    assert_eq!(h.db.list_queue_for_user(aiko).unwrap().len(), 2);
    assert_eq!(h.slack.sent().len(), 2);
}

#[tokio::test]
async fn reply_advances_the_drip() {
    let h = harness(&[2, 0, -1]);
    let aiko = h.user("aiko");
    let deck = h.task("Deck", Some(due_in(0)), &[aiko]);
    h.task("Budget", Some(due_in(2)), &[aiko]);
    h.engine.run_daily_sweep(h.company, now()).await.unwrap();
    let entries = h.db.list_queue_for_user(aiko).unwrap();
    let (e1, e2) = (entries[0].id, entries[1].id);

    let reply_at = now() + Duration::minutes(20);
    let resolution = h
        .engine
        .resolve_reply(ChannelKind::Slack, &slack_addr("aiko"), None, ReplyOutcome::Done, "shipped", reply_at)
        .await
        .unwrap();

    assert_eq!(
        resolution,
        ReplyResolution::Resolved {
            entry_id: e1,
            task_id: deck,
            escalated_to: 0,
            next_entry_id: Some(e2),
        }
    );
    assert_eq!(
        h.statuses(aiko),
        vec![QueueStatus::Replied, QueueStatus::AwaitingReply]
    );
    assert!(h.db.get_task(deck).unwrap().unwrap().done);

    // No second intro on the same day.
    let texts = h.slack.texts_to(&slack_addr("aiko"));
    assert_eq!(texts.len(), 3);
    assert!(texts[2].contains("Budget") && texts[2].contains("due in 2 days"));

    let e1 = h.db.get_queue_entry(e1).unwrap().unwrap();
    let reply = h
        .db
        .get_chat_message(e1.reply_message_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(reply.direction, "inbound");
    assert_eq!(reply.content, "shipped");
    let sent = h.db.get_chat_message(e1.message_id.unwrap()).unwrap().unwrap();
    assert_eq!(sent.kind, "reminder");
    assert_eq!(sent.external_id.as_deref(), Some("slack-2"));
}

#[tokio::test]
async fn counters_follow_overdue_reminders() {
    let h = harness(&[2, 0, -1]);
    let aiko = h.user("aiko");
    let audit = h.task("Audit", Some(due_in(-1)), &[aiko]);

    h.engine.run_daily_sweep(h.company, now()).await.unwrap();
    let task = h.db.get_task(audit).unwrap().unwrap();
    assert_eq!(task.reminded_count, 1);
    assert_eq!(task.delayed_count, 1);
    assert!(h.slack.texts_to(&slack_addr("aiko"))[1].contains("1 day overdue"));

    h.engine
        .resolve_reply(ChannelKind::Slack, &slack_addr("aiko"), None, ReplyOutcome::Done, "", now())
        .await
        .unwrap();
    let task = h.db.get_task(audit).unwrap().unwrap();
    assert!(task.done);
    assert_eq!(task.delayed_count, 0);
}

#[tokio::test]
async fn outcomes_update_task_flags() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    let a = h.task("A", Some(due_in(0)), &[aiko]);
    let b = h.task("B", Some(due_in(0)), &[aiko]);
    let c = h.task("C", Some(due_in(0)), &[aiko]);
    h.engine.run_daily_sweep(h.company, now()).await.unwrap();
    let addr = slack_addr("aiko");

    for outcome in [ReplyOutcome::Withdrawn, ReplyOutcome::InProgress, ReplyOutcome::Delayed] {
        h.engine
            .resolve_reply(ChannelKind::Slack, &addr, None, outcome, "", now())
            .await
            .unwrap();
    }

    let a = h.db.get_task(a).unwrap().unwrap();
    assert!(a.closed && !a.done);
    let b = h.db.get_task(b).unwrap().unwrap();
    assert!(!b.closed && !b.done);
    let c = h.db.get_task(c).unwrap().unwrap();
    assert!(!c.closed && !c.done);
    assert_eq!(h.statuses(aiko), vec![QueueStatus::Replied; 3]);
}

#[tokio::test]
#[traced_test]
async fn failed_send_leaves_entry_waiting() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    let deck = h.task("Deck", Some(due_in(0)), &[aiko]);
    h.slack.fail_sends(true);

    let report = h.engine.run_daily_sweep(h.company, now()).await.unwrap();

    assert_eq!(report.dispatched, 0);
    assert!(report.failed_users.is_empty());
    assert_eq!(h.statuses(aiko), vec![QueueStatus::Waiting]);
    assert_eq!(h.db.get_task(deck).unwrap().unwrap().reminded_count, 0);
    assert!(logs_contain("intro send failed"));

    h.slack.fail_sends(false);
    let sent = h.engine.dispatch_pending(now() + Duration::minutes(1)).await.unwrap();
    assert_eq!(sent, 1);
    assert_eq!(h.statuses(aiko), vec![QueueStatus::AwaitingReply]);
    // The intro was not recorded by the failed attempt, so it goes out now.
    assert_eq!(h.slack.texts_to(&slack_addr("aiko")).len(), 2);
}

#[tokio::test]
#[traced_test]
async fn unreachable_user_is_skipped() {
    let h = harness(&[0]);
    let ghost = h.unreachable_user("ghost");
    let aiko = h.user("aiko");
    h.task("Deck", Some(due_in(0)), &[ghost, aiko]);

    let report = h.engine.run_daily_sweep(h.company, now()).await.unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.statuses(ghost), vec![QueueStatus::Waiting]);
    assert_eq!(h.statuses(aiko), vec![QueueStatus::AwaitingReply]);

    // Tick retries stay quiet for an entry already reported.
    for minutes in [1, 2, 3] {
        h.engine
            .dispatch_pending(now() + Duration::minutes(minutes))
            .await
            .unwrap();
    }
    assert_eq!(h.statuses(ghost), vec![QueueStatus::Waiting]);
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|l| l.contains("no reachable chat address"))
            .count()
        {
            1 => Ok(()),
            n => Err(format!("expected one unreachable warning, got {n}")),
        }
    });
}

#[tokio::test]
async fn closed_task_is_dropped_before_sending() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    h.task("A", Some(due_in(0)), &[aiko]);
    let b = h.task("B", Some(due_in(0)), &[aiko]);
    let c = h.task("C", Some(due_in(0)), &[aiko]);
    h.engine.run_daily_sweep(h.company, now()).await.unwrap();

    // B is finished in the tracker while A is still in flight.
    h.db.mark_task_done(b).unwrap();
    let resolution = h
        .engine
        .resolve_reply(ChannelKind::Slack, &slack_addr("aiko"), None, ReplyOutcome::Done, "", now())
        .await
        .unwrap();

    let entries = h.db.list_queue_for_user(aiko).unwrap();
    assert_eq!(
        entries.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![
            QueueStatus::Replied,
            QueueStatus::TimeoutNotSent,
            QueueStatus::AwaitingReply
        ]
    );
    assert_eq!(entries[2].task_id, c);
    match resolution {
        ReplyResolution::Resolved { next_entry_id, .. } => assert_eq!(next_entry_id, Some(entries[2].id)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn run_for_user_touches_only_that_user() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    let ben = h.user("ben");
    h.task("Deck", Some(due_in(0)), &[aiko, ben]);

    let report = h.engine.run_for_user(aiko, now()).await.unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.statuses(aiko), vec![QueueStatus::AwaitingReply]);
    assert!(h.statuses(ben).is_empty());
    assert!(h.slack.texts_to(&slack_addr("ben")).is_empty());
}

#[tokio::test]
async fn telegram_used_when_slack_missing() {
    let h = harness(&[0]);
    let yui = h.unreachable_user("yui");
    h.db.set_user_channel(yui, ChannelKind::Telegram, "9001").unwrap();
    h.db.set_user_channel(yui, ChannelKind::Line, "U-yui").unwrap();
    h.task("Deck", Some(due_in(0)), &[yui]);

    h.engine.run_daily_sweep(h.company, now()).await.unwrap();

    assert!(h.slack.sent().is_empty());
    let sent = h.telegram.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|s| s.address == "9001"));
    assert_eq!(sent[1].message.actions, ReplyOutcome::ALL.to_vec());
}
