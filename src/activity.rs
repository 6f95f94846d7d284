//! "Who changed what most recently" summaries.

use serde::Serialize;

use crate::state::State;

/// The latest change one user made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserActivity {
    pub user: String,
    /// Address of the most recently changed function, if any was ever
    /// changed.
    pub function: Option<u64>,
    pub function_name: Option<String>,
    pub last_change: Option<i64>,
}

impl UserActivity {
    pub fn of(state: &State) -> Self {
        let latest = state
            .functions()
            .values()
            .filter_map(|f| f.last_change.map(|ts| (f, ts)))
            .max_by_key(|(_, ts)| *ts);

        match latest {
            Some((func, ts)) => Self {
                user: state.user.clone(),
                function: Some(func.addr),
                function_name: func.name().map(str::to_string),
                last_change: Some(ts),
            },
            None => Self {
                user: state.user.clone(),
                function: None,
                function_name: None,
                last_change: state.last_push().map(|p| p.time),
            },
        }
    }
}

/// Render the distance between `ts` and `now` (both Unix seconds) as
/// "5 minutes ago" or "2 days in the future".
pub fn friendly_datetime(ts: i64, now: i64) -> String {
    let diff = now - ts;
    let secs = diff.unsigned_abs();
    let amount = if secs >= 24 * 60 * 60 {
        format!("{} days", secs / (24 * 60 * 60))
    } else if secs >= 60 * 60 {
        format!("{} hours", secs / (60 * 60))
    } else if secs >= 60 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{secs} seconds")
    };
    if diff >= 0 {
        format!("{amount} ago")
    } else {
        format!("{amount} in the future")
    }
}
