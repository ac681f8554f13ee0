//! Build metadata stamped by build.rs, logged once at daemon boot.

pub fn build_host() -> &'static str {
    option_env!("PEI_BUILD_HOST").unwrap_or("unknown")
}

/// The stamped `epoch:<secs>` marker rendered as a UTC timestamp. Anything
/// that is not an epoch marker passes through untouched.
pub fn build_time_pretty() -> String {
    format_build_time(option_env!("PEI_BUILD_TIME").unwrap_or("unknown"))
}

fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    let Some(epoch) = raw.strip_prefix("epoch:") else {
        return raw.to_string();
    };
    epoch
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| raw.to_string())
}
