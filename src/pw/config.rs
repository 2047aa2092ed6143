use crate::pw::engine::EntryTable;
use crate::pw::entry::SupervisedEntry;
use anyhow::Context as _;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_RESTARTS: u32 = 3;

fn default_restart_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    services: Vec<ServiceSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// 0 (or missing) means the default budget.
    #[serde(default)]
    max_restarts: u32,
    /// Integer milliseconds or a string like "500ms", "2s", "1m".
    #[serde(
        default = "default_restart_delay_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    restart_delay: u64,
    #[serde(default = "default_backoff_factor")]
    backoff_factor: f64,
    #[serde(default)]
    memory_mb: Option<u64>,
    #[serde(default)]
    cpu_percent: Option<u32>,
    #[serde(default)]
    max_pids: Option<u32>,
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be an integer milliseconds or string like \"1s\"",
        )),
    }
}

fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    // e.g. 1000ms, 10s, 1m, 2h
    let mut idx = 0usize;
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
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

/// Loads the services file and builds the entry table.
pub fn load_entries(config_path: &Path) -> anyhow::Result<EntryTable> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_entries(&raw)
        .with_context(|| format!("failed to load config {}", config_path.display()))
}

/// Parses a services document into an entry table.
///
/// `max_restarts: 0` is interpreted as "use the default" to stay compatible
/// with configs that spell out the field without meaning "never restart";
/// a zero budget is not expressible in the file format.
pub fn parse_entries(raw: &str) -> anyhow::Result<EntryTable> {
    let file: ConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
    anyhow::ensure!(!file.services.is_empty(), "config declares no services");

    let mut table = EntryTable::new();
    for svc in file.services {
        let name = svc.name.trim().to_string();
        anyhow::ensure!(!name.is_empty(), "service name must not be empty");
        anyhow::ensure!(
            !table.contains_key(&name),
            "duplicate service name {name:?}"
        );
        anyhow::ensure!(
            !svc.command.trim().is_empty(),
            "service {name}: command must not be empty"
        );
        anyhow::ensure!(
            svc.backoff_factor >= 1.0,
            "service {name}: backoff_factor must be >= 1.0"
        );
        if let Some(mb) = svc.memory_mb {
            anyhow::ensure!(mb > 0, "service {name}: memory_mb must be positive");
        }
        if let Some(pct) = svc.cpu_percent {
            anyhow::ensure!(pct > 0, "service {name}: cpu_percent must be positive");
        }
        if let Some(n) = svc.max_pids {
            anyhow::ensure!(n > 0, "service {name}: max_pids must be positive");
        }

        let mut entry = SupervisedEntry::new(name.as_str(), svc.command.trim(), svc.args);
        entry.max_restarts = if svc.max_restarts == 0 {
            DEFAULT_MAX_RESTARTS
        } else {
            svc.max_restarts
        };
        entry.restart_delay = Duration::from_millis(svc.restart_delay);
        entry.backoff_factor = svc.backoff_factor;
        entry.memory_limit_bytes = svc.memory_mb.map(|mb| mb * 1024 * 1024);
        entry.cpu_quota_percent = svc.cpu_percent;
        entry.pids_limit = svc.max_pids;
        table.insert(name, entry);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_service() {
        let table = parse_entries(
            r#"
services:
  - name: web
    command: /usr/bin/myserver
    args: ["--port", "8080"]
    max_restarts: 5
    restart_delay: 2s
    backoff_factor: 1.5
    memory_mb: 256
    cpu_percent: 50
    max_pids: 64
"#,
        )
        .unwrap();

        let web = &table["web"];
        assert_eq!(web.command, "/usr/bin/myserver");
        assert_eq!(web.args, vec!["--port", "8080"]);
        assert_eq!(web.max_restarts, 5);
        assert_eq!(web.restart_delay, Duration::from_secs(2));
        assert_eq!(web.backoff_factor, 1.5);
        assert_eq!(web.memory_limit_bytes, Some(256 * 1024 * 1024));
        assert_eq!(web.cpu_quota_percent, Some(50));
        assert_eq!(web.pids_limit, Some(64));
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let table = parse_entries(
            r#"
services:
  - name: minimal
    command: /bin/sleep
    args: ["3600"]
"#,
        )
        .unwrap();

        let e = &table["minimal"];
        assert_eq!(e.max_restarts, DEFAULT_MAX_RESTARTS);
        assert_eq!(e.restart_delay, Duration::from_secs(1));
        assert_eq!(e.backoff_factor, 2.0);
        assert_eq!(e.memory_limit_bytes, None);
        assert_eq!(e.cpu_quota_percent, None);
        assert_eq!(e.pids_limit, None);
    }

    #[test]
    fn zero_max_restarts_means_default() {
        let table = parse_entries(
            "services:\n  - name: svc\n    command: /bin/true\n    max_restarts: 0\n",
        )
        .unwrap();
        assert_eq!(table["svc"].max_restarts, DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn duration_strings_and_integers_both_work() {
        assert_eq!(parse_duration_str("1500ms").unwrap(), 1500);
        assert_eq!(parse_duration_str("2s").unwrap(), 2000);
        assert_eq!(parse_duration_str("1m").unwrap(), 60_000);
        assert_eq!(parse_duration_str("0.5s").unwrap(), 500);
        assert!(parse_duration_str("5d").is_err());
        assert!(parse_duration_str("fast").is_err());

        let table = parse_entries(
            "services:\n  - name: svc\n    command: /bin/true\n    restart_delay: 250\n",
        )
        .unwrap();
        assert_eq!(table["svc"].restart_delay, Duration::from_millis(250));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse_entries(
            "services:\n  - name: svc\n    command: /bin/true\n    restart_policy: always\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = parse_entries(
            "services:\n  - name: svc\n    command: /bin/true\n  - name: svc\n    command: /bin/false\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate service name"));
    }

    #[test]
    fn empty_service_list_is_rejected() {
        assert!(parse_entries("services: []\n").is_err());
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(
            parse_entries("services:\n  - name: svc\n    command: /bin/true\n    memory_mb: 0\n")
                .is_err()
        );
        assert!(
            parse_entries("services:\n  - name: svc\n    command: /bin/true\n    cpu_percent: 0\n")
                .is_err()
        );
    }
}
