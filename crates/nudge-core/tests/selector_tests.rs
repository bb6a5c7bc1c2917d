mod common;

use common::*;
use nudge_core::{
    render::{PlainRenderer, Renderer},
    selector::{group_by_user, select_candidates},
};

#[test]
fn only_exact_policy_offsets_match() {
    let h = harness(&[2, 0, -1]);
    let aiko = h.user("aiko");
    let tomorrow = h.task("Tomorrow", Some(due_in(1)), &[aiko]);
    let today = h.task("Today", Some(due_in(0)), &[aiko]);

    let candidates = select_candidates(&h.db, h.company, now(), TZ, 10, None).unwrap();

    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert_eq!(c.task.id, today);
    assert_ne!(c.task.id, tomorrow);
    assert_eq!(c.remind_days, 0);
    assert!(PlainRenderer
        .reminder(&c.task, c.remind_days)
        .text
        .contains("due today"));
}

#[test]
fn closed_done_and_undated_tasks_are_skipped() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    let done = h.task("Done", Some(due_in(0)), &[aiko]);
    let closed = h.task("Closed", Some(due_in(0)), &[aiko]);
    h.task("Undated", None, &[aiko]);
    let open = h.task("Open", Some(due_in(0)), &[aiko]);
    h.db.mark_task_done(done).unwrap();
    h.db.mark_task_closed(closed).unwrap();

    let candidates = select_candidates(&h.db, h.company, now(), TZ, 10, None).unwrap();

    assert_eq!(
        candidates.iter().map(|c| c.task.id).collect::<Vec<_>>(),
        vec![open]
    );
}

#[test]
fn reminded_count_cap_excludes_task() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    let nagged = h.task("Nagged", Some(due_in(0)), &[aiko]);
    let fresh = h.task("Fresh", Some(due_in(0)), &[aiko]);
    h.db.record_reminder_sent(nagged, false).unwrap();
    h.db.record_reminder_sent(nagged, false).unwrap();

    let capped = select_candidates(&h.db, h.company, now(), TZ, 2, None).unwrap();
    assert_eq!(
        capped.iter().map(|c| c.task.id).collect::<Vec<_>>(),
        vec![fresh]
    );
    let uncapped = select_candidates(&h.db, h.company, now(), TZ, 3, None).unwrap();
    assert_eq!(uncapped.len(), 2);
}

#[test]
fn one_candidate_per_responsible_user() {
    let h = harness(&[2, 0]);
    let aiko = h.user("aiko");
    let ben = h.user("ben");
    let shared = h.task("Shared", Some(due_in(0)), &[aiko, ben]);
    let solo = h.task("Solo", Some(due_in(2)), &[ben]);

    let candidates = select_candidates(&h.db, h.company, now(), TZ, 10, None).unwrap();
    assert_eq!(candidates.len(), 3);

    let grouped = group_by_user(candidates);
    assert_eq!(
        grouped[&aiko].iter().map(|c| c.task.id).collect::<Vec<_>>(),
        vec![shared]
    );
    assert_eq!(
        grouped[&ben].iter().map(|c| c.task.id).collect::<Vec<_>>(),
        vec![shared, solo]
    );

    let only_ben = select_candidates(&h.db, h.company, now(), TZ, 10, Some(ben)).unwrap();
    assert!(only_ben.iter().all(|c| c.user_id == ben));
    assert_eq!(only_ben.len(), 2);
}

#[test]
fn other_companies_and_empty_policy() {
    let h = harness(&[0]);
    let aiko = h.user("aiko");
    h.task("Ours", Some(due_in(0)), &[aiko]);
    let quiet = h.db.insert_company("Quiet", &[]).unwrap();

    assert_eq!(
        select_candidates(&h.db, h.company, now(), TZ, 10, None)
            .unwrap()
            .len(),
        1
    );
    assert!(select_candidates(&h.db, quiet, now(), TZ, 10, None)
        .unwrap()
        .is_empty());
    assert!(select_candidates(&h.db, 999, now(), TZ, 10, None).is_err());
}

#[test]
fn late_evening_deadline_counts_by_calendar_day() {
    let h = harness(&[1]);
    let aiko = h.user("aiko");
    // 23:59 JST tomorrow and 00:01 JST tomorrow are both one day out.
    let late = h.task("Late", Some(at("2024-05-11T14:59:00Z")), &[aiko]);
    let early = h.task("Early", Some(at("2024-05-10T15:01:00Z")), &[aiko]);

    let candidates = select_candidates(&h.db, h.company, now(), TZ, 10, None).unwrap();
    let ids: Vec<i64> = candidates.iter().map(|c| c.task.id).collect();
    assert_eq!(ids, vec![early, late]);
    assert!(candidates.iter().all(|c| c.remind_days == 1));
}
