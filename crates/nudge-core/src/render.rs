use crate::types::{OutboundMessage, ReplyOutcome, Task, User};

/// Produces the channel-agnostic bodies the engine sends. The engine only
/// forwards and logs what comes back.
pub trait Renderer: Send + Sync {
    fn intro(&self, user: &User) -> OutboundMessage;
    fn reminder(&self, task: &Task, remind_days: i64) -> OutboundMessage;
    fn report_intro(&self, superior: &User, subordinate: &User) -> OutboundMessage;
    fn report(
        &self,
        subordinate: &User,
        task: &Task,
        outcome: ReplyOutcome,
        content: &str,
    ) -> OutboundMessage;
}

/// Plain-text bodies, one line each.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainRenderer;

fn plural(n: i64) -> &'static str {
    if n == 1 {
        "day"
    } else {
        "days"
    }
}

/// Human phrasing of a remind-days value.
pub fn due_phrase(remind_days: i64) -> String {
    match remind_days {
        0 => "due today".to_string(),
        n if n > 0 => format!("due in {n} {}", plural(n)),
        n => format!("{} {} overdue", -n, plural(-n)),
    }
}

impl Renderer for PlainRenderer {
    fn intro(&self, user: &User) -> OutboundMessage {
        OutboundMessage::text(format!(
            "Good morning {}, a quick check on your tasks. I'll ask about them one at a time.",
            user.name
        ))
    }

    fn reminder(&self, task: &Task, remind_days: i64) -> OutboundMessage {
        OutboundMessage {
            text: format!(
                "\"{}\" is {}. How is it going?",
                task.title,
                due_phrase(remind_days)
            ),
            actions: ReplyOutcome::ALL.to_vec(),
        }
    }

    fn report_intro(&self, superior: &User, subordinate: &User) -> OutboundMessage {
        OutboundMessage::text(format!(
            "{}, here is a task update from {}.",
            superior.name, subordinate.name
        ))
    }

    fn report(
        &self,
        subordinate: &User,
        task: &Task,
        outcome: ReplyOutcome,
        content: &str,
    ) -> OutboundMessage {
        let mut text = format!(
            "{} on \"{}\": {}",
            subordinate.name,
            task.title,
            outcome.label()
        );
        let content = content.trim();
        if !content.is_empty() {
            text.push_str(&format!("\n> {content}"));
        }
        OutboundMessage::text(text)
    }
}
