use std::time::Duration;

const UNITS: [(&str, u64); 6] = [
    ("year", 31_557_600), // 365.25 days
    ("month", 2_630_016), // 30.44 days
    ("day", 86_400),
    ("hour", 3_600),
    ("minute", 60),
    ("second", 1),
];

/// Render a duration for log output, e.g. `1 day, 2 hours`. Sub-second precision is dropped.
pub fn humanize_duration(duration: Duration) -> String {
    let mut remaining = duration.as_secs();
    let mut components = Vec::new();
    for (name, seconds) in UNITS {
        let count = remaining / seconds;
        remaining %= seconds;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            components.push(format!("{count} {name}{plural}"));
        }
    }
    if components.is_empty() {
        return "0 seconds".to_string();
    }
    components.join(", ")
}

/// Convert a signed `time` duration (as found in certificate math) for display.
pub fn humanize_signed_duration(duration: ::time::Duration) -> String {
    humanize_duration(Duration::from_secs(duration.whole_seconds().unsigned_abs()))
}
