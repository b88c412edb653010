use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Project working calendar. Opaque to the store; read by the scheduling
/// engine and captured in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calendar {
    pub working_days: Vec<Weekday>,
    pub hours_per_day: f64,
    pub holidays: Vec<NaiveDate>,
}

impl Default for Calendar {
    fn default() -> Self {
        Self {
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            hours_per_day: 8.0,
            holidays: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cal: Calendar = serde_json::from_str(r#"{"hours_per_day": 7.5}"#).unwrap();
        assert_eq!(cal.hours_per_day, 7.5);
        assert_eq!(cal.working_days.len(), 5);
    }
}
