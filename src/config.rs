use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SUPPORTED_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How a service should be restarted after it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    #[default]
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        }
    }
}

/// A managed service, immutable after load.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    /// Catalog key; filled in from the `services` map after parse.
    #[serde(skip)]
    pub name: String,

    pub command: Vec<String>,

    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Advisory only; no runtime contract.
    #[serde(default)]
    pub requires_root: bool,

    #[serde(default)]
    pub restart: RestartPolicy,

    /// 0 means unbounded.
    #[serde(default)]
    pub max_restarts: u32,

    #[serde(default, deserialize_with = "deserialize_duration")]
    pub restart_delay: Duration,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Optional file the capture also appends raw stdout lines to.
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    /// Optional file the capture also appends raw stderr lines to.
    #[serde(default)]
    pub stderr: Option<PathBuf>,

    /// Re-run period for oneshot services; ignored unless `oneshot` is set.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    #[serde(default)]
    pub oneshot: bool,

    /// Treat service output lines as structured JSON logs.
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub version: String,

    #[serde(default)]
    pub services: BTreeMap<String, Service>,
}

impl Config {
    /// Service names in dependency order: every service appears after all of
    /// its `depends_on` entries. `validate` has already rejected cycles.
    pub fn start_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::with_capacity(self.services.len());
        let mut placed: std::collections::BTreeSet<&str> = Default::default();

        while order.len() < self.services.len() {
            let mut advanced = false;
            for (name, svc) in &self.services {
                if placed.contains(name.as_str()) {
                    continue;
                }
                if svc
                    .depends_on
                    .iter()
                    .all(|d| placed.contains(d.as_str()))
                {
                    placed.insert(name);
                    order.push(name.clone());
                    advanced = true;
                }
            }
            if !advanced {
                // Unreachable after validation; do not loop forever on a bug.
                for name in self.services.keys() {
                    if !placed.contains(name.as_str()) {
                        order.push(name.clone());
                    }
                }
                break;
            }
        }
        order
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim() != SUPPORTED_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported version {:?} (expected {SUPPORTED_VERSION:?})",
                self.version
            )));
        }

        for (name, svc) in &self.services {
            if svc.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service {name}: command must not be empty"
                )));
            }
            for dep in &svc.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(ConfigError::Invalid(format!(
                        "service {name}: depends_on references unknown service {dep:?}"
                    )));
                }
            }
        }

        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<(), ConfigError> {
        // 0 = unvisited, 1 = on the current path, 2 = done.
        let mut state: BTreeMap<&str, u8> = BTreeMap::new();

        fn visit<'a>(
            services: &'a BTreeMap<String, Service>,
            state: &mut BTreeMap<&'a str, u8>,
            name: &'a str,
        ) -> Result<(), ConfigError> {
            match state.get(name).copied().unwrap_or(0) {
                1 => {
                    return Err(ConfigError::Invalid(format!(
                        "depends_on cycle involving service {name:?}"
                    )))
                }
                2 => return Ok(()),
                _ => {}
            }
            state.insert(name, 1);
            if let Some(svc) = services.get(name) {
                for dep in &svc.depends_on {
                    visit(services, state, dep)?;
                }
            }
            state.insert(name, 2);
            Ok(())
        }

        for name in self.services.keys() {
            visit(&self.services, &mut state, name)?;
        }
        Ok(())
    }
}

/// Parse and validate the service catalog. No side effects.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut cfg: Config = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    // Service names come from the map keys.
    for (name, svc) in cfg.services.iter_mut() {
        svc.name = name.clone();
    }

    cfg.validate()?;
    Ok(cfg)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    let ms = match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("duration must be a non-negative integer (ms)"))?,
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom)?,
        _ => {
            return Err(D::Error::custom(
                "duration must be an integer milliseconds or string like \"5s\"",
            ))
        }
    };
    Ok(Duration::from_millis(ms))
}

pub(crate) fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    // e.g. 500ms, 10s, 1m, 2h
    let mut idx = t.len();
    for (i, ch) in t.char_indices() {
        if !(ch.is_ascii_digit() || ch == '.') {
            idx = i;
            break;
        }
    }
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number: {e}"))?;
    if num < 0.0 {
        return Err("duration must be >= 0".to_string());
    }
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "" | "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn load_str(yaml: &str) -> Result<Config, ConfigError> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        load(f.path())
    }

    #[test]
    fn parses_full_service() {
        let cfg = load_str(
            r#"
version: "1.0"
services:
  web:
    command: ["/usr/bin/web", "--port", "8080"]
    user: www
    group: www
    working_dir: /srv/web
    environment:
      RUST_LOG: info
    restart: on-failure
    max_restarts: 3
    restart_delay: "5s"
    json_logs: true
"#,
        )
        .unwrap();
        let svc = &cfg.services["web"];
        assert_eq!(svc.name, "web");
        assert_eq!(svc.command[0], "/usr/bin/web");
        assert_eq!(svc.restart, RestartPolicy::OnFailure);
        assert_eq!(svc.max_restarts, 3);
        assert_eq!(svc.restart_delay, Duration::from_secs(5));
        assert!(svc.json_logs);
        assert!(!svc.oneshot);
    }

    #[test]
    fn restart_defaults_to_never() {
        let cfg = load_str(
            r#"
version: "1.0"
services:
  job:
    command: ["true"]
    user: nobody
    group: nobody
"#,
        )
        .unwrap();
        assert_eq!(cfg.services["job"].restart, RestartPolicy::Never);
        assert_eq!(cfg.services["job"].max_restarts, 0);
        assert_eq!(cfg.services["job"].restart_delay, Duration::ZERO);
    }

    #[test]
    fn duration_accepts_integer_ms_and_unit_strings() {
        assert_eq!(parse_duration_str("1500").unwrap(), 1500);
        assert_eq!(parse_duration_str("500ms").unwrap(), 500);
        assert_eq!(parse_duration_str("2s").unwrap(), 2000);
        assert_eq!(parse_duration_str("1m").unwrap(), 60_000);
        assert_eq!(parse_duration_str("1.5h").unwrap(), 5_400_000);
        assert!(parse_duration_str("5 parsecs").is_err());
        assert!(parse_duration_str("").is_err());
    }

    #[test]
    fn rejects_empty_command() {
        let err = load_str(
            r#"
version: "1.0"
services:
  broken:
    command: []
    user: nobody
    group: nobody
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("command must not be empty"));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = load_str("version: \"2.0\"\nservices: {}\n").unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = load_str(
            r#"
version: "1.0"
services:
  svc:
    command: ["true"]
    nice_level: 10
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = load_str(
            r#"
version: "1.0"
services:
  app:
    command: ["true"]
    depends_on: [db]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let err = load_str(
            r#"
version: "1.0"
services:
  a:
    command: ["true"]
    depends_on: [b]
  b:
    command: ["true"]
    depends_on: [a]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn start_order_puts_dependencies_first() {
        let cfg = load_str(
            r#"
version: "1.0"
services:
  app:
    command: ["true"]
    depends_on: [cache, db]
  cache:
    command: ["true"]
    depends_on: [db]
  db:
    command: ["true"]
"#,
        )
        .unwrap();
        let order = cfg.start_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("db") < pos("cache"));
        assert!(pos("cache") < pos("app"));
        assert_eq!(order.len(), 3);
    }
}
