//! Daemon configuration, loaded from environment variables with an optional
//! dotenv-style fallback file. Environment variables always win over the
//! file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default capability tags advertised to Prime: the built-in handler
/// families.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "shell", "files", "docker", "services", "git", "network", "process",
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Human-facing daemon name (defaults to the hostname).
    pub name: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    /// host:port of the Prime link endpoint.
    pub prime_address: String,
    /// Pre-shared secret presented at registration.
    pub registration_key: String,
    /// True for the daemon running on Prime's own server. Identity only: the
    /// flag is propagated to Prime, which decides what it permits.
    pub is_soul_daemon: bool,
    /// Root of the Alfred installation, set when `is_soul_daemon`.
    pub alfred_root: Option<String>,
    /// Paths the file-watcher emitter observes.
    pub watch_paths: Vec<WatchSpec>,
}

/// One file-watcher target parsed from `DAEMON_WATCH_PATHS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub path: PathBuf,
    pub recursive: bool,
    /// Optional glob matched against file names.
    pub pattern: Option<String>,
}

impl Config {
    /// Load configuration from the process environment, consulting
    /// `env_file` (default `.env`) for variables the environment leaves
    /// unset.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let mut vars: HashMap<String, String> = std::env::vars().collect();
        let file = env_file.unwrap_or_else(|| Path::new(".env"));
        if let Ok(content) = std::fs::read_to_string(file) {
            for (key, value) in parse_env_file(&content) {
                vars.entry(key).or_insert(value);
            }
        }
        Self::from_vars(&vars)
    }

    /// Build a config from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let hostname = system_hostname();
        let is_soul_daemon = vars
            .get("DAEMON_IS_SOUL")
            .map(|v| parse_bool(v))
            .unwrap_or(false);

        let mut capabilities: Vec<String> = match vars.get("DAEMON_CAPABILITIES") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
        };
        if is_soul_daemon {
            capabilities.push("soul".to_string());
            capabilities.push("self-modify".to_string());
        }

        let watch_paths = match vars.get("DAEMON_WATCH_PATHS") {
            Some(raw) => parse_watch_paths(raw)?,
            None => Vec::new(),
        };

        let config = Self {
            name: vars
                .get("DAEMON_NAME")
                .cloned()
                .unwrap_or_else(|| hostname.clone()),
            hostname,
            capabilities,
            prime_address: vars
                .get("PRIME_ADDRESS")
                .cloned()
                .unwrap_or_else(|| "localhost:50051".to_string()),
            registration_key: vars
                .get("DAEMON_REGISTRATION_KEY")
                .cloned()
                .unwrap_or_default(),
            is_soul_daemon,
            alfred_root: vars.get("ALFRED_ROOT").cloned().filter(|s| !s.is_empty()),
            watch_paths,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.registration_key.is_empty(),
            "DAEMON_REGISTRATION_KEY is required"
        );
        anyhow::ensure!(
            !self.prime_address.is_empty(),
            "PRIME_ADDRESS must not be empty"
        );
        if self.is_soul_daemon {
            anyhow::ensure!(
                self.alfred_root.is_some(),
                "ALFRED_ROOT is required when DAEMON_IS_SOUL is set"
            );
        }
        Ok(())
    }
}

/// Parse `KEY=value` lines. Blank lines and `#` comments are skipped.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    vars
}

/// Parse `DAEMON_WATCH_PATHS`: comma-separated `path[:pattern]` entries,
/// with a trailing `/**` on the path enabling recursion.
/// Example: `/var/log/**:*.log,/etc/hosts`.
pub fn parse_watch_paths(raw: &str) -> Result<Vec<WatchSpec>> {
    let mut specs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (path_part, pattern) = match entry.rsplit_once(':') {
            Some((path, pat)) if !pat.contains('/') && !pat.is_empty() => {
                (path, Some(pat.to_string()))
            }
            _ => (entry, None),
        };
        let (path_part, recursive) = match path_part.strip_suffix("/**") {
            Some(stripped) => (stripped, true),
            None => (path_part, false),
        };
        anyhow::ensure!(!path_part.is_empty(), "empty path in watch spec {entry:?}");
        specs.push(WatchSpec {
            path: PathBuf::from(path_part),
            recursive,
            pattern,
        });
    }
    Ok(specs)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// The OS hostname, via gethostname(2).
pub fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "localhost".to_string()
}

/// Apply an env file on top of `vars` for keys not already present, then
/// build the config. Split out for tests; `load` is the same over the real
/// environment.
pub fn load_with_file(mut vars: HashMap<String, String>, file: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading env file: {}", file.display()))?;
    for (key, value) in parse_env_file(&content) {
        vars.entry(key).or_insert(value);
    }
    Config::from_vars(&vars)
}
