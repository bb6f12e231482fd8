//! Message bodies for outbound notifications.
//!
//! Plain text only; anything richer belongs to a presentation layer outside
//! this crate.

use chrono::{DateTime, Utc};

use crate::types::ReminderWindow;

pub fn format_due(due_at: DateTime<Utc>) -> String {
    due_at.format("%B %d, %Y at %I:%M %p UTC").to_string()
}

/// The reminder body for one window. Each window has its own urgency of
/// voice, matching how far out it fires.
pub fn reminder_message(
    title: &str,
    due_at: DateTime<Utc>,
    window: ReminderWindow,
    course_name: Option<&str>,
) -> String {
    let due = format_due(due_at);
    let mut body = match window {
        ReminderWindow::OneWeek => format!(
            "📅 Heads-up: '{}' is due in one week.\n\nDue: {}\n\nTime to start planning.",
            title, due
        ),
        ReminderWindow::ThreeDays => format!(
            "⚠️ '{}' is due in 3 days.\n\nDue: {}\n\nMake sure you're on track.",
            title, due
        ),
        ReminderWindow::OneDay => format!(
            "🔔 Reminder: '{}' is due in 24 hours.\n\nDue: {}",
            title, due
        ),
        ReminderWindow::EightHours => format!(
            "🚨 '{}' is due in 8 hours.\n\nDue: {}\n\nTime to finish up.",
            title, due
        ),
        ReminderWindow::TwoHours => format!(
            "🔥 Final stretch: '{}' is due in 2 hours.\n\nDue: {}",
            title, due
        ),
        ReminderWindow::OneHour => format!(
            "⏱ Last call: '{}' is due in 1 hour. Submit soon!\n\nDue: {}",
            title, due
        ),
    };
    if let Some(course) = course_name {
        body.push_str(&format!("\nCourse: {}", course));
    }
    body
}

/// Sent once, best-effort, when a lapsed premium subscription is downgraded.
pub fn downgrade_notice() -> String {
    "Your premium access has expired, so you're back on the free plan. \
     You'll keep getting the 24-hour reminder for every deadline, and you \
     can renew premium any time from the menu."
        .to_string()
}
