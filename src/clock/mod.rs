use chrono::{Local, NaiveDate, Utc};
use serde::Deserialize;

/// Time zone used to decide which calendar day a flush or direct record
/// is attributed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timezone {
    #[default]
    Local,
    Utc,
}

/// Source of "today" for aggregate rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Wall clock in the given time zone.
    System(Timezone),
    /// Always returns the same date.
    Fixed(NaiveDate),
}

impl Clock {
    /// Returns the current calendar date.
    pub fn today(&self) -> NaiveDate {
        match self {
            Self::System(Timezone::Local) => Local::now().date_naive(),
            Self::System(Timezone::Utc) => Utc::now().date_naive(),
            Self::Fixed(date) => *date,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::System(Timezone::Local)
    }
}

impl From<Timezone> for Clock {
    fn from(tz: Timezone) -> Self {
        Self::System(tz)
    }
}
