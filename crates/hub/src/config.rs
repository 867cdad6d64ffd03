use std::{env, path::PathBuf, time::Duration};

use tracing::warn;
use uuid::Uuid;

use crate::{rpc::ClientInfo, supervisor::SessionLauncher};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BINARY: &str = "codex";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration resolved from the environment.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    /// True when no `CODEX_HUB_TOKEN` was set and a random one was minted.
    pub token_generated: bool,
    pub data_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub default_codex_home: PathBuf,
    pub default_cwd: Option<PathBuf>,
    pub codex_bin: PathBuf,
    pub codex_flags: Vec<String>,
    pub app_server_flags: Vec<String>,
}

impl HubConfig {
    pub fn from_env() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let data_dir = env::var_os("CODEX_HUB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".codex-hub"));
        let profiles_dir = env::var_os("CODEX_HUB_PROFILES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("profiles"));
        let default_codex_home = env::var_os("CODEX_HUB_DEFAULT_CODEX_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".codex"));

        let (token, token_generated) = match env::var("CODEX_HUB_TOKEN") {
            Ok(token) if !token.trim().is_empty() => (token, false),
            _ => (Uuid::new_v4().to_string(), true),
        };

        let port = env::var("CODEX_HUB_PORT")
            .ok()
            .and_then(|raw| match raw.parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!("ignoring unparseable CODEX_HUB_PORT `{raw}`");
                    None
                }
            })
            .unwrap_or(DEFAULT_PORT);

        Self {
            host: env::var("CODEX_HUB_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port,
            token,
            token_generated,
            data_dir,
            profiles_dir,
            default_codex_home,
            default_cwd: env::var_os("CODEX_HUB_DEFAULT_CWD").map(PathBuf::from),
            codex_bin: env::var_os("CODEX_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY)),
            codex_flags: flag_list("CODEX_FLAGS", "CODEX_FLAGS_JSON"),
            app_server_flags: flag_list("CODEX_APP_SERVER_FLAGS", "CODEX_APP_SERVER_FLAGS_JSON"),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.data_dir.join("analytics.sqlite")
    }

    pub fn threads_path(&self) -> PathBuf {
        self.data_dir.join("threads.sqlite")
    }

    pub fn reviews_path(&self) -> PathBuf {
        self.data_dir.join("reviews.sqlite")
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.data_dir.join("profiles.json")
    }

    pub fn launcher(&self) -> SessionLauncher {
        SessionLauncher {
            binary: self.codex_bin.clone(),
            base_args: self.codex_flags.clone(),
            app_server_args: self.app_server_flags.clone(),
            default_cwd: self.default_cwd.clone(),
            client_info: ClientInfo {
                name: "codex-hub".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Resolves a flag list: the `*_JSON` variant (a JSON string array) wins
/// when set and valid; the plain variant is whitespace-split.
pub(crate) fn flag_list(plain_var: &str, json_var: &str) -> Vec<String> {
    if let Ok(raw) = env::var(json_var) {
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(flags) => return flags,
            Err(err) => warn!("ignoring unparseable {json_var}: {err}"),
        }
    }

    env::var(plain_var)
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
