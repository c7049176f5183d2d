//! Human readable durations for status lines

const MINUTE: i64 = 60;
const HOUR: i64 = MINUTE * 60;
const DAY: i64 = HOUR * 24;
const WEEK: i64 = DAY * 7;

/// Describe a time span given in seconds, e.g. "2 hours 34 minutes ago".
///
/// Negative spans are described as lying in the future.
pub fn seconds_to_human(delta: i64) -> String {
    let (delta, desc) = if delta < 0 {
        (delta.saturating_neg(), "in the future")
    } else {
        (delta, "ago")
    };
    if delta < MINUTE {
        return format!("{delta} seconds {desc}");
    }
    if delta < 2 * MINUTE {
        return format!("a minute {desc}");
    }
    if delta < HOUR {
        return format!("{} minutes {desc}", delta / MINUTE);
    }
    if delta < DAY {
        let hours = delta / HOUR;
        let mins = (delta - hours * HOUR) / MINUTE;
        if mins > 0 {
            return format!("{hours} hours {mins} minutes {desc}");
        }
        return format!("{hours} hours {desc}");
    }
    if delta < 2 * WEEK {
        return format!("{} days {desc}", delta / DAY);
    }
    format!("{} weeks {desc}", delta / WEEK)
}

/// Seconds elapsed since `since`, clamped at zero for clocks that went backwards.
pub fn seconds_since(since: chrono::DateTime<chrono::Local>) -> i64 {
    (chrono::Local::now() - since).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_spans() {
        assert_eq!(seconds_to_human(0), "0 seconds ago");
        assert_eq!(seconds_to_human(59), "59 seconds ago");
        assert_eq!(seconds_to_human(61), "a minute ago");
        assert_eq!(seconds_to_human(10 * MINUTE), "10 minutes ago");
    }

    #[test]
    fn hours_and_minutes() {
        assert_eq!(seconds_to_human(2 * HOUR), "2 hours ago");
        assert_eq!(
            seconds_to_human(2 * HOUR + 34 * MINUTE),
            "2 hours 34 minutes ago"
        );
    }

    #[test]
    fn days_and_weeks() {
        assert_eq!(seconds_to_human(3 * DAY), "3 days ago");
        assert_eq!(seconds_to_human(3 * WEEK), "3 weeks ago");
        assert_eq!(seconds_to_human(30 * DAY), "4 weeks ago");
    }

    #[test]
    fn future_spans() {
        assert_eq!(seconds_to_human(-30), "30 seconds in the future");
        assert_eq!(
            seconds_to_human(-90 * MINUTE),
            "1 hours 30 minutes in the future"
        );
    }
}
