//! Editor for the `[mcp_servers]` block of a profile's
//! `CODEX_HOME/config.toml`. Unrelated keys in the document are preserved
//! untouched; only the addressed server entry is rewritten.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::{value::Table as TomlTable, Value as TomlValue};

/// Config filename under a profile's `CODEX_HOME`.
pub const CONFIG_FILE: &str = "config.toml";
const MCP_SERVERS_KEY: &str = "mcp_servers";

/// Stdio MCP server configuration stored under `[mcp_servers.<name>]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerDefinition {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Errors surfaced while editing a profile's config.toml.
#[derive(Debug, Error)]
pub enum ConfigTomlError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode server definition: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("MCP server `{0}` not found")]
    NotFound(String),
}

/// File-backed editor bound to one config.toml path.
pub struct ConfigTomlEditor {
    path: PathBuf,
}

impl ConfigTomlEditor {
    pub fn for_home(codex_home: &Path) -> Self {
        Self {
            path: codex_home.join(CONFIG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every configured MCP server. A missing file or block is an
    /// empty map.
    pub fn list(&self) -> Result<BTreeMap<String, McpServerDefinition>, ConfigTomlError> {
        let document = self.load()?;
        let Some(servers) = document.get(MCP_SERVERS_KEY).and_then(TomlValue::as_table) else {
            return Ok(BTreeMap::new());
        };

        let mut entries = BTreeMap::new();
        for (name, value) in servers {
            let definition =
                value
                    .clone()
                    .try_into()
                    .map_err(|source| ConfigTomlError::Parse {
                        path: self.path.clone(),
                        source,
                    })?;
            entries.insert(name.clone(), definition);
        }
        Ok(entries)
    }

    pub fn get(&self, name: &str) -> Result<McpServerDefinition, ConfigTomlError> {
        self.list()?
            .remove(name)
            .ok_or_else(|| ConfigTomlError::NotFound(name.to_string()))
    }

    /// Adds or replaces one server entry, preserving the rest of the file.
    pub fn upsert(
        &self,
        name: &str,
        definition: &McpServerDefinition,
    ) -> Result<(), ConfigTomlError> {
        let mut document = self.load()?;
        let encoded = TomlValue::try_from(definition)?;

        match document
            .entry(MCP_SERVERS_KEY.to_string())
            .or_insert_with(|| TomlValue::Table(TomlTable::new()))
        {
            TomlValue::Table(table) => {
                table.insert(name.to_string(), encoded);
            }
            other => {
                let mut table = TomlTable::new();
                table.insert(name.to_string(), encoded);
                *other = TomlValue::Table(table);
            }
        }

        self.store(&document)
    }

    pub fn remove(&self, name: &str) -> Result<(), ConfigTomlError> {
        let mut document = self.load()?;
        let removed = document
            .get_mut(MCP_SERVERS_KEY)
            .and_then(TomlValue::as_table_mut)
            .and_then(|table| table.remove(name));
        if removed.is_none() {
            return Err(ConfigTomlError::NotFound(name.to_string()));
        }
        self.store(&document)
    }

    fn load(&self) -> Result<TomlTable, ConfigTomlError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(TomlTable::new()),
            Err(source) => {
                return Err(ConfigTomlError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigTomlError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, document: &TomlTable) -> Result<(), ConfigTomlError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigTomlError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let serialized = toml::to_string_pretty(document)?;
        fs::write(&self.path, serialized).map_err(|source| ConfigTomlError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
