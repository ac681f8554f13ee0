//! Global log sink. Level and format come from the environment so the
//! container image can switch them without a config edit.

use tracing::Level;

const ENV_LEVEL: &str = "PEI_LOG_LEVEL";
const ENV_FORMAT: &str = "PEI_LOG_FORMAT";

fn level_from_env() -> Level {
    match std::env::var(ENV_LEVEL).unwrap_or_default().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. Call once, before any other output.
pub fn init() {
    let level = level_from_env();
    let json = std::env::var(ENV_FORMAT).as_deref() == Ok("json");

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        std::env::remove_var(ENV_LEVEL);
        assert_eq!(level_from_env(), Level::INFO);
        std::env::set_var(ENV_LEVEL, "loud");
        assert_eq!(level_from_env(), Level::INFO);
        std::env::set_var(ENV_LEVEL, "warn");
        assert_eq!(level_from_env(), Level::WARN);
        std::env::remove_var(ENV_LEVEL);
    }
}
