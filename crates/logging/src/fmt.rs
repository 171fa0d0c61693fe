//! Human-readable formatting for the end-of-job report.

/// Formats a byte count with a binary-unit suffix, e.g. `"3.4 MiB"`.
#[must_use]
pub fn pretty_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Formats nanoseconds as `h:mm:ss`, or fractional seconds below a minute.
#[must_use]
pub fn pretty_duration(nanos: u64) -> String {
    let total_secs = nanos / 1_000_000_000;
    if total_secs < 60 {
        let millis = nanos / 1_000_000;
        if millis < 1000 {
            return format!("{millis}ms");
        }
        return format!("{:.1}s", nanos as f64 / 1_000_000_000.0);
    }
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{hours}:{mins:02}:{secs:02}")
}

/// Formats one stats-report line for an operation class.
#[must_use]
pub fn stats_line(name: &str, time_nanos: u64, count: u64) -> String {
    format!("   {name:<18} {:>10} ({count})", pretty_duration(time_nanos))
}
