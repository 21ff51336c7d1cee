//! On-disk configuration format (`mcp.json` / `.1mcprc`).
//!
//! The file follows the standard MCP client format: transport fields live at
//! the top level of each entry (`command`/`args`/`env` for stdio,
//! `url`/`headers` for network transports), with aggregator extensions
//! (`tags`, `disabled`, `oauth`). Unknown fields are rejected so typos
//! surface as load errors instead of silently ignored behavior.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::config::params::{OauthParams, ServerParams, TransportKind};
use crate::error::ConfigError;

lazy_static! {
    /// `${VAR}` and `${VAR:-default}` placeholders.
    static ref ENV_PLACEHOLDER: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap();
}

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(rename = "$schema")]
    pub schema: Option<String>,
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerEntry>,
    #[serde(rename = "mcpTemplates", default)]
    pub mcp_templates: BTreeMap<String, ServerEntry>,
}

/// `env` accepts either a map or a list of `KEY=VALUE` strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvTable {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl EnvTable {
    fn into_map(self, server: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        match self {
            EnvTable::Map(map) => Ok(map),
            EnvTable::List(entries) => {
                let mut map = BTreeMap::new();
                for entry in entries {
                    let (key, value) =
                        entry
                            .split_once('=')
                            .ok_or_else(|| ConfigError::InvalidServer {
                                name: server.to_string(),
                                reason: format!("env entry '{entry}' is not KEY=VALUE"),
                            })?;
                    map.insert(key.to_string(), value.to_string());
                }
                Ok(map)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OauthEntry {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A single server entry as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<EnvTable>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub tags: Option<Vec<String>>,
    pub disabled: Option<bool>,
    pub oauth: Option<OauthEntry>,
}

impl ServerEntry {
    /// Resolve the entry into immutable [`ServerParams`], expanding
    /// environment placeholders and platform paths.
    pub fn into_params(self, name: &str, template: bool) -> Result<ServerParams, ConfigError> {
        let kind = self.resolve_kind(name)?;

        let command = self
            .command
            .map(|c| expand_env(&c, name))
            .transpose()?
            .map(|c| expand_path(&c));
        let args = self
            .args
            .unwrap_or_default()
            .into_iter()
            .map(|a| expand_env(&a, name))
            .collect::<Result<Vec<_>, _>>()?;
        let env = self
            .env
            .map(|e| e.into_map(name))
            .transpose()?
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| Ok((k, expand_env(&v, name)?)))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
        let cwd = self
            .cwd
            .map(|c| expand_env(&c, name))
            .transpose()?
            .map(|c| expand_path(&c));
        let url = self.url.map(|u| expand_env(&u, name)).transpose()?;
        let headers = self
            .headers
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| Ok((k, expand_env(&v, name)?)))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        match kind {
            TransportKind::Stdio if command.is_none() => {
                return Err(ConfigError::InvalidServer {
                    name: name.to_string(),
                    reason: "stdio transport requires 'command'".into(),
                });
            }
            TransportKind::Sse | TransportKind::Http if url.is_none() => {
                return Err(ConfigError::InvalidServer {
                    name: name.to_string(),
                    reason: format!("{} transport requires 'url'", kind.as_str()),
                });
            }
            _ => {}
        }

        let tags: BTreeSet<String> = self
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(ServerParams {
            name: name.to_string(),
            kind,
            command,
            args,
            env,
            cwd,
            url,
            headers,
            tags,
            disabled: self.disabled.unwrap_or(false),
            oauth: self.oauth.map(|o| OauthParams {
                client_id: o.client_id,
                client_secret: o.client_secret,
                scopes: o.scopes,
            }),
            template,
        })
    }

    fn resolve_kind(&self, name: &str) -> Result<TransportKind, ConfigError> {
        if let Some(kind) = &self.kind {
            return match kind.as_str() {
                "stdio" => Ok(TransportKind::Stdio),
                "sse" => Ok(TransportKind::Sse),
                "http" | "streamable-http" => Ok(TransportKind::Http),
                other => Err(ConfigError::InvalidServer {
                    name: name.to_string(),
                    reason: format!("unknown transport type '{other}'"),
                }),
            };
        }
        // No explicit type: infer from which transport fields are present.
        match (&self.command, &self.url) {
            (Some(_), None) => Ok(TransportKind::Stdio),
            (None, Some(_)) => Ok(TransportKind::Http),
            (Some(_), Some(_)) => Err(ConfigError::InvalidServer {
                name: name.to_string(),
                reason: "both 'command' and 'url' set; add an explicit 'type'".into(),
            }),
            (None, None) => Err(ConfigError::InvalidServer {
                name: name.to_string(),
                reason: "one of 'command' or 'url' is required".into(),
            }),
        }
    }
}

/// Expand `${VAR}` / `${VAR:-default}` placeholders in a string field.
///
/// A placeholder with no default and no matching environment variable is a
/// configuration error; typos should fail loudly at load time.
pub fn expand_env(input: &str, server: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in ENV_PLACEHOLDER.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let var = &caps[1];
        out.push_str(&input[last..whole.start()]);
        match std::env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => {
                    tracing::debug!(server = %server, var = %var, "unset placeholder variable");
                    return Err(ConfigError::MissingEnvVar(var.to_string()));
                }
            },
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Expand a leading `~` and `%APPDATA%` in path-like fields.
pub fn expand_path(input: &str) -> String {
    let mut expanded = if input == "~" {
        dirs::home_dir()
            .map(|home| home.display().to_string())
            .unwrap_or_else(|| input.to_string())
    } else if let Some(rest) = input.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest).display().to_string(),
            None => input.to_string(),
        }
    } else {
        input.to_string()
    };
    if expanded.contains("%APPDATA%") {
        let appdata = std::env::var("APPDATA")
            .ok()
            .or_else(|| dirs::config_dir().map(|p| p.display().to_string()));
        if let Some(appdata) = appdata {
            expanded = expanded.replace("%APPDATA%", &appdata);
        }
    }
    expanded
}

/// Parse a configuration file's raw JSON.
pub fn parse(path: &Path, contents: &str) -> Result<ConfigFile, ConfigError> {
    serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
