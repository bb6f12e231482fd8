use serde::{Deserialize, Serialize};

/// Subscription tier as stored on a user row.
///
/// The stored tier alone never proves an active subscription; callers derive
/// the effective state with `subscription::SubscriptionState::derive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            other => anyhow::bail!("unknown subscription tier '{}'", other),
        }
    }
}

/// Where a task row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    RemoteAssignment,
    RemoteEvent,
    Manual,
}

impl TaskOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskOrigin::RemoteAssignment => "remote_assignment",
            TaskOrigin::RemoteEvent => "remote_event",
            TaskOrigin::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "remote_assignment" => Ok(TaskOrigin::RemoteAssignment),
            "remote_event" => Ok(TaskOrigin::RemoteEvent),
            "manual" => Ok(TaskOrigin::Manual),
            other => anyhow::bail!("unknown task origin '{}'", other),
        }
    }
}

/// A named offset before a task's due time at which a reminder may fire.
///
/// `ALL` is ordered furthest-out first; the reminder job iterates it in that
/// order and stops after the first dispatch attempt per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderWindow {
    OneWeek,
    ThreeDays,
    OneDay,
    EightHours,
    TwoHours,
    OneHour,
}

impl ReminderWindow {
    pub const ALL: [ReminderWindow; 6] = [
        ReminderWindow::OneWeek,
        ReminderWindow::ThreeDays,
        ReminderWindow::OneDay,
        ReminderWindow::EightHours,
        ReminderWindow::TwoHours,
        ReminderWindow::OneHour,
    ];

    pub fn hours_before(self) -> i64 {
        match self {
            ReminderWindow::OneWeek => 168,
            ReminderWindow::ThreeDays => 72,
            ReminderWindow::OneDay => 24,
            ReminderWindow::EightHours => 8,
            ReminderWindow::TwoHours => 2,
            ReminderWindow::OneHour => 1,
        }
    }

    /// Column holding this window's persisted sent-marker.
    pub fn column(self) -> &'static str {
        match self {
            ReminderWindow::OneWeek => "reminder_1w_sent",
            ReminderWindow::ThreeDays => "reminder_3d_sent",
            ReminderWindow::OneDay => "reminder_24h_sent",
            ReminderWindow::EightHours => "reminder_8h_sent",
            ReminderWindow::TwoHours => "reminder_2h_sent",
            ReminderWindow::OneHour => "reminder_1h_sent",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReminderWindow::OneWeek => "1_week",
            ReminderWindow::ThreeDays => "3_days",
            ReminderWindow::OneDay => "24_hours",
            ReminderWindow::EightHours => "8_hours",
            ReminderWindow::TwoHours => "2_hours",
            ReminderWindow::OneHour => "1_hour",
        }
    }
}
