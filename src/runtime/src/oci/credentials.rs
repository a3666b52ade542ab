//! Registry credentials from Docker's `config.json`.
//!
//! Only the static `auths` section is read; credential helpers are not
//! invoked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use squash_core::error::{Result, SquashError};

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Credentials loaded from a Docker client configuration file.
#[derive(Debug, Default)]
pub struct DockerCredentials {
    entries: HashMap<String, (String, String)>,
}

impl DockerCredentials {
    /// `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    /// Load credentials from `path`. A missing file yields no credentials.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            SquashError::ConfigError(format!(
                "Failed to read Docker config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&data).map_err(|e| {
            SquashError::ConfigError(format!(
                "Failed to parse Docker config {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn parse(data: &str) -> std::result::Result<Self, String> {
        let file: DockerConfigFile = serde_json::from_str(data).map_err(|e| e.to_string())?;

        let mut entries = HashMap::new();
        for (server, entry) in file.auths {
            let pair = match (entry.username, entry.password, entry.auth) {
                (Some(user), Some(pass), _) => Some((user, pass)),
                (_, _, Some(auth)) if !auth.is_empty() => Some(decode_auth(&auth)?),
                _ => None,
            };
            if let Some(pair) = pair {
                entries.insert(normalize_registry(&server), pair);
            }
        }
        Ok(Self { entries })
    }

    /// `(username, password)` for `registry`, if present.
    pub fn get(&self, registry: &str) -> Option<(String, String)> {
        self.entries.get(&normalize_registry(registry)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_auth(auth: &str) -> std::result::Result<(String, String), String> {
    let bytes = STANDARD
        .decode(auth.trim())
        .map_err(|e| format!("invalid base64 auth: {}", e))?;
    let text = String::from_utf8(bytes).map_err(|_| "auth is not UTF-8".to_string())?;
    text.split_once(':')
        .map(|(user, pass)| (user.to_string(), pass.to_string()))
        .ok_or_else(|| "auth is not user:password".to_string())
}

/// Reduce a server key to a bare host. Docker Hub aliases collapse to
/// `docker.io`.
fn normalize_registry(server: &str) -> String {
    let server = server.trim().to_lowercase();
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(&server);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            "docker.io".to_string()
        }
        other => other.to_string(),
    }
}
