//! Per-child output capture.
//!
//! Each live child gets two reader tasks, one per pipe. Lines are re-emitted
//! through the global log sink attributed to the service; services flagged
//! with `json_logs` get their own level and message lifted out of the line,
//! with the remaining keys preserved under a `service_` prefix.

use crate::config::Service;
use serde_json::Value;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};

const LEVEL_KEYS: [&str; 3] = ["level", "severity", "lvl"];
const MESSAGE_KEYS: [&str; 4] = ["msg", "message", "text", "content"];

pub struct OutputCapture {
    stop: watch::Sender<bool>,
}

impl OutputCapture {
    /// Spawn the two reader tasks for a freshly started child.
    pub fn start(
        svc: &Service,
        pid: i32,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: impl AsyncRead + Unpin + Send + 'static,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(pump(
            svc.clone(),
            pid,
            "stdout",
            stdout,
            stop_rx.clone(),
        ));
        tokio::spawn(pump(svc.clone(), pid, "stderr", stderr, stop_rx));
        Self { stop: stop_tx }
    }

    /// Ask both readers to exit at the next line boundary. Dropping the
    /// capture has the same effect.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

async fn pump<R>(
    svc: Service,
    pid: i32,
    stream: &'static str,
    reader: R,
    mut stop: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    // Optional file hint: mirror raw lines into the configured path.
    let tee_path = match stream {
        "stdout" => svc.stdout.clone(),
        _ => svc.stderr.clone(),
    };
    let mut tee = match &tee_path {
        Some(p) => open_append(p).await,
        None => None,
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            r = lines.next_line() => match r {
                Ok(Some(raw)) => {
                    let line = raw.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(f) = tee.as_mut() {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                    emit(&svc, pid, stream, line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(service = %svc.name, stream, error = %e, "error reading service output");
                    break;
                }
            },
            _ = stop.changed() => break,
        }
    }
}

async fn open_append(path: &Path) -> Option<fs::File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }
    match fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open service log file");
            None
        }
    }
}

pub(crate) enum Classified {
    Plain,
    Structured {
        level: Level,
        message: String,
        /// Remaining keys of the original record, `service_`-prefixed,
        /// re-serialized as one JSON object.
        extra: String,
    },
}

/// Decide how a captured line is logged. Services without `json_logs`, and
/// lines that do not parse as a JSON object, stay plain.
pub(crate) fn classify(json_logs: bool, line: &str) -> Classified {
    if !json_logs {
        return Classified::Plain;
    }
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
        return Classified::Plain;
    };

    let level = LEVEL_KEYS
        .iter()
        .find_map(|key| lookup_ci(&map, key))
        .and_then(Value::as_str)
        .map(parse_level)
        .unwrap_or(Level::INFO);

    let message = MESSAGE_KEYS
        .iter()
        .find_map(|key| lookup_ci(&map, key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "service structured log".to_string());

    let mut extra = serde_json::Map::new();
    for (k, v) in &map {
        let lower = k.to_ascii_lowercase();
        if LEVEL_KEYS.contains(&lower.as_str()) || MESSAGE_KEYS.contains(&lower.as_str()) {
            continue;
        }
        extra.insert(format!("service_{k}"), v.clone());
    }
    let extra = Value::Object(extra).to_string();

    Classified::Structured {
        level,
        message,
        extra,
    }
}

fn lookup_ci<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

pub(crate) fn parse_level(s: &str) -> Level {
    match s.to_ascii_uppercase().as_str() {
        "DEBUG" | "DBG" | "TRACE" => Level::DEBUG,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" | "ERR" | "FATAL" | "CRITICAL" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn emit(svc: &Service, pid: i32, stream: &'static str, line: &str) {
    match classify(svc.json_logs, line) {
        Classified::Plain => {
            info!(service = %svc.name, pid, stream, user = %svc.user, output = line, "service output");
        }
        Classified::Structured {
            level,
            message,
            extra,
        } => {
            if level == Level::ERROR {
                error!(service = %svc.name, pid, stream, user = %svc.user, fields = %extra, "{message}");
            } else if level == Level::WARN {
                warn!(service = %svc.name, pid, stream, user = %svc.user, fields = %extra, "{message}");
            } else if level == Level::DEBUG {
                debug!(service = %svc.name, pid, stream, user = %svc.user, fields = %extra, "{message}");
            } else {
                info!(service = %svc.name, pid, stream, user = %svc.user, fields = %extra, "{message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_tokens_map_case_insensitively() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("TRACE"), Level::DEBUG);
        assert_eq!(parse_level("Warning"), Level::WARN);
        assert_eq!(parse_level("FATAL"), Level::ERROR);
        assert_eq!(parse_level("err"), Level::ERROR);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn plain_when_json_logs_disabled() {
        assert!(matches!(
            classify(false, r#"{"level":"error","msg":"boom"}"#),
            Classified::Plain
        ));
    }

    #[test]
    fn plain_when_line_is_not_a_json_object() {
        assert!(matches!(classify(true, "hello world"), Classified::Plain));
        assert!(matches!(classify(true, "[1, 2, 3]"), Classified::Plain));
        assert!(matches!(classify(true, "{not json"), Classified::Plain));
    }

    #[test]
    fn structured_extracts_level_and_message() {
        let Classified::Structured {
            level,
            message,
            extra,
        } = classify(true, r#"{"severity":"WARN","text":"low disk","free_mb":12}"#)
        else {
            panic!("expected structured");
        };
        assert_eq!(level, Level::WARN);
        assert_eq!(message, "low disk");
        assert_eq!(extra, r#"{"service_free_mb":12}"#);
    }

    #[test]
    fn structured_defaults_when_fields_missing() {
        let Classified::Structured { level, message, .. } =
            classify(true, r#"{"event":"tick"}"#)
        else {
            panic!("expected structured");
        };
        assert_eq!(level, Level::INFO);
        assert_eq!(message, "service structured log");
    }

    #[test]
    fn consumed_keys_do_not_leak_into_extra() {
        let Classified::Structured { extra, .. } = classify(
            true,
            r#"{"level":"info","msg":"up","message":"dup","ts":"t0"}"#,
        ) else {
            panic!("expected structured");
        };
        assert_eq!(extra, r#"{"service_ts":"t0"}"#);
    }
}
