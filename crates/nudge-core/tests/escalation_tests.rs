mod common;

use common::*;
use nudge_core::{
    escalation::EscalationRouter, render::PlainRenderer, ChannelKind, ReplyOutcome,
    ReplyResolution,
};
use tracing_test::traced_test;

#[tokio::test]
async fn reply_reaches_every_direct_superior() {
    let h = harness(&[0]);
    let u = h.user("u");
    let s1 = h.user("s1");
    let s2 = h.user("s2");
    let grand = h.user("grand");
    let u2 = h.user("u2");
    h.db.add_reporting_edge(u, s1).unwrap();
    h.db.add_reporting_edge(u, s2).unwrap();
    h.db.add_reporting_edge(s1, grand).unwrap();
    h.task("Deck", Some(due_in(0)), &[u]);
    h.task("Memo", Some(due_in(0)), &[u2]);
    h.engine.run_daily_sweep(h.company, now()).await.unwrap();

    let resolution = h
        .engine
        .resolve_reply(
            ChannelKind::Slack,
            &slack_addr("u"),
            None,
            ReplyOutcome::Delayed,
            "waiting on legal",
            now(),
        )
        .await
        .unwrap();
    assert!(matches!(resolution, ReplyResolution::Resolved { escalated_to: 2, .. }));

    for sup in ["s1", "s2"] {
        let texts = h.slack.texts_to(&slack_addr(sup));
        assert_eq!(texts.len(), 2, "{sup}");
        assert!(texts[0].contains("update from u"));
        assert!(texts[1].contains("Deck") && texts[1].contains("Delayed"));
        assert!(texts[1].contains("waiting on legal"));
    }
    // One hop only.
    assert!(h.slack.texts_to(&slack_addr("grand")).is_empty());

    let before = h.slack.sent().len();
    let resolution = h
        .engine
        .resolve_reply(ChannelKind::Slack, &slack_addr("u2"), None, ReplyOutcome::Done, "", now())
        .await
        .unwrap();
    assert!(matches!(resolution, ReplyResolution::Resolved { escalated_to: 0, .. }));
    assert_eq!(h.slack.sent().len(), before);

    let s1_log = h.db.list_chat_messages(s1).unwrap();
    let kinds: Vec<&str> = s1_log.iter().map(|m| m.kind.as_str()).collect();
    assert_eq!(kinds, vec!["report_intro", "report"]);
}

#[tokio::test]
#[traced_test]
async fn unreachable_superior_is_skipped() {
    let h = harness(&[0]);
    let u = h.user("u");
    let nowhere = h.unreachable_user("nowhere");
    let s2 = h.user("s2");
    h.db.add_reporting_edge(u, nowhere).unwrap();
    h.db.add_reporting_edge(u, s2).unwrap();
    let deck = h.task("Deck", Some(due_in(0)), &[u]);
    let task = h.db.get_task(deck).unwrap().unwrap();
    let user = h.db.get_user(u).unwrap().unwrap();

    let router = EscalationRouter {
        db: &h.db,
        channels: &StubResolver::default().with(h.company, h.slack.clone()),
        renderer: &PlainRenderer,
    };
    let report = router
        .escalate(&user, &task, ReplyOutcome::InProgress, "", now())
        .await
        .unwrap();

    assert_eq!(report.delivered, vec![s2]);
    assert_eq!(report.skipped, vec![nowhere]);
    assert!(report.failed.is_empty());
    assert!(logs_contain("superior has no reachable chat address"));
}

#[tokio::test]
#[traced_test]
async fn failing_superior_does_not_block_others() {
    let h = harness(&[0]);
    let u = h.user("u");
    let tg_boss = h.unreachable_user("tg_boss");
    h.db.set_user_channel(tg_boss, ChannelKind::Telegram, "777").unwrap();
    let s2 = h.user("s2");
    h.db.add_reporting_edge(u, tg_boss).unwrap();
    h.db.add_reporting_edge(u, s2).unwrap();
    h.db.add_reporting_edge(u, u).unwrap();
    let deck = h.task("Deck", Some(due_in(0)), &[u]);
    let task = h.db.get_task(deck).unwrap().unwrap();
    let user = h.db.get_user(u).unwrap().unwrap();
    h.telegram.fail_sends(true);

    let resolver = StubResolver::default()
        .with(h.company, h.slack.clone())
        .with(h.company, h.telegram.clone());
    let router = EscalationRouter {
        db: &h.db,
        channels: &resolver,
        renderer: &PlainRenderer,
    };
    let report = router
        .escalate(&user, &task, ReplyOutcome::Done, "", now())
        .await
        .unwrap();

    assert_eq!(report.delivered, vec![s2]);
    assert_eq!(report.failed, vec![tg_boss]);
    assert_eq!(report.skipped, vec![u]);
    assert!(logs_contain("escalation send failed"));
    assert!(logs_contain("reporting edge points at itself"));
}
