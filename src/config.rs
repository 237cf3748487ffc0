//! Configuration management for devrack.
//!
//! This module defines the on-disk project layout (`.dev/`), the structure of
//! `.dev/servers.json`, template rendering for `{PORT}`/`{ROLE}` placeholders,
//! and the `init` step that infers servers from `package.json`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DevError, Result};

/// Environment variable naming the default log-follow command.
pub const LOG_VIEWER_ENV: &str = "DEV_LOG_VIEWER";
/// Log-follow command used when neither the option nor the environment sets one.
pub const DEFAULT_LOG_VIEWER: &str = "tail -f";

const PORT_PLACEHOLDER: &str = "{PORT}";
const ROLE_PLACEHOLDER: &str = "{ROLE}";
const SERVER_SCRIPT_PATTERNS: [&str; 4] = ["dev", "start", "serve", "preview"];
const EXCLUDED_SCRIPT_PATTERNS: [&str; 3] = ["build", "test", "lint"];
const FIRST_INFERRED_PORT: u16 = 3000;
const INFERRED_PORT_SPACING: u16 = 10;

/// Paths of everything devrack keeps under a project's `.dev` directory.
#[derive(Debug, Clone)]
pub struct DevPaths {
    root: PathBuf,
    dev_dir: PathBuf,
}

impl DevPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dev_dir = root.join(".dev");
        Self { root, dev_dir }
    }

    /// Project root; spawned servers run with this as their working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn servers_file(&self) -> PathBuf {
        self.dev_dir.join("servers.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.dev_dir.join("pid.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dev_dir.join("log")
    }

    pub fn log_file(&self, server: &str) -> PathBuf {
        self.log_dir()
            .join(format!("{}.log", sanitize_server_name(server)))
    }

    pub fn ensure_log_dir(&self) -> Result<()> {
        fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

/// A single entry of `.dev/servers.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    /// Shell command; may contain `{PORT}` and `{ROLE}`.
    pub command: String,
    /// Port to try first, or the fallback when the server picks its own.
    pub preferred_port: u16,
    /// Health-check URL template; may contain `{PORT}` and `{ROLE}`.
    #[serde(rename = "healthCheck")]
    pub health_check_url: String,
}

impl ServerDefinition {
    /// Whether devrack injects the port, or the server selects one itself.
    pub fn takes_port(&self) -> bool {
        self.command.contains(PORT_PLACEHOLDER)
    }

    pub fn render_command(&self, port: u16, role: &str) -> String {
        render_template(&self.command, port, role)
    }

    pub fn render_health_url(&self, port: u16, role: &str) -> String {
        render_template(&self.health_check_url, port, role)
    }
}

/// Server definitions keyed by name, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServersConfig {
    servers: IndexMap<String, ServerDefinition>,
}

impl ServersConfig {
    pub fn get(&self, name: &str) -> Result<&ServerDefinition> {
        self.servers
            .get(name)
            .ok_or_else(|| DevError::UnknownServer(name.to_string()))
    }

    /// The first declared server, used when `start` is given no name.
    pub fn first(&self) -> Option<&str> {
        self.servers.keys().next().map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, server: ServerDefinition) {
        self.servers.insert(name.into(), server);
    }
}

/// Loads and parses `.dev/servers.json`.
pub fn load_servers(paths: &DevPaths) -> Result<ServersConfig> {
    let path = paths.servers_file();
    if !path.exists() {
        return Err(DevError::ConfigMissing { path });
    }
    let raw = fs::read_to_string(&path)?;
    let config: ServersConfig =
        serde_json::from_str(&raw).map_err(|source| DevError::ConfigParse {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), servers = config.len(), "loaded server config");
    Ok(config)
}

/// Replaces every `{PORT}` and `{ROLE}` occurrence in `template`.
pub fn render_template(template: &str, port: u16, role: &str) -> String {
    template
        .replace(PORT_PLACEHOLDER, &port.to_string())
        .replace(ROLE_PLACEHOLDER, role)
}

/// Maps a server name to something safe to use as a file name.
pub fn sanitize_server_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Resolves the log-follow command: explicit option, then `DEV_LOG_VIEWER`, then `tail -f`.
pub fn log_viewer_command(option: Option<&str>) -> String {
    let from_env = env::var(LOG_VIEWER_ENV).ok();
    choose_log_viewer(option, from_env.as_deref())
}

fn choose_log_viewer(option: Option<&str>, from_env: Option<&str>) -> String {
    option
        .filter(|value| !value.is_empty())
        .or(from_env.filter(|value| !value.is_empty()))
        .unwrap_or(DEFAULT_LOG_VIEWER)
        .to_string()
}

/// Creates `.dev/` with a `servers.json` inferred from `package.json`.
///
/// Returns the names of the servers written.
pub fn init_project(paths: &DevPaths) -> Result<Vec<String>> {
    let servers_file = paths.servers_file();
    if servers_file.exists() {
        return Err(DevError::ConfigExists { path: servers_file });
    }

    let package_json = paths.root().join("package.json");
    if !package_json.exists() {
        return Err(DevError::Config(format!(
            "{} not found in project root",
            package_json.display()
        )));
    }
    let raw = fs::read_to_string(&package_json)?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
        DevError::Config(format!("failed to parse {}: {}", package_json.display(), err))
    })?;

    let mut servers = infer_servers(&manifest);
    if servers.is_empty() {
        servers.insert("dev", inferred_server("dev", "dev", FIRST_INFERRED_PORT));
    }

    paths.ensure_log_dir()?;
    let serialized = serde_json::to_string_pretty(&servers)
        .map_err(|err| DevError::Config(err.to_string()))?;
    fs::write(&servers_file, serialized)?;
    fs::write(paths.state_file(), "{}")?;

    Ok(servers.names().map(str::to_string).collect())
}

/// Picks the `package.json` scripts that look like long-running servers.
pub fn infer_servers(manifest: &serde_json::Value) -> ServersConfig {
    let mut servers = ServersConfig::default();
    let Some(scripts) = manifest.get("scripts").and_then(|s| s.as_object()) else {
        return servers;
    };

    let mut port = FIRST_INFERRED_PORT;
    for (script, command) in scripts {
        let command = command.as_str().unwrap_or_default();
        if !is_server_script(script, command) {
            continue;
        }
        servers.insert(script.clone(), inferred_server(script, script, port));
        port = port.saturating_add(INFERRED_PORT_SPACING);
    }
    servers
}

fn is_server_script(script: &str, command: &str) -> bool {
    let looks_like_server = SERVER_SCRIPT_PATTERNS.iter().any(|p| script.contains(p))
        && !EXCLUDED_SCRIPT_PATTERNS.iter().any(|p| script.contains(p));
    // A script that calls back into this tool would recurse on start.
    let reenters = command.starts_with("devrack") || command.contains("npx dev");
    looks_like_server && !reenters
}

fn inferred_server(name: &str, script: &str, port: u16) -> ServerDefinition {
    ServerDefinition {
        command: format!(
            "npm run {} > .dev/log/{}.log 2>&1",
            script,
            sanitize_server_name(name)
        ),
        preferred_port: port,
        health_check_url: "http://localhost:{PORT}".to_string(),
    }
}
