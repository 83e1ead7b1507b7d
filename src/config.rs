//! Agent configuration loading and validation.
//!
//! Reads a YAML file describing the model endpoint, the system prompt and the
//! tool backends (local programs and containers). Values of the form
//! `${VAR}` / `${VAR:-default}` are interpolated from the environment before
//! parsing. Everything that can be checked without starting a backend is
//! checked in [`AgentConfig::validate`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::backend::container::{ContainerSpec, EnvEntry, MountConfig};
use crate::backend::local::LocalProgramSpec;
use crate::toolset::DiscoveryPolicy;

/// Separator between a backend name and one of its operations.
pub const NAMESPACE_SEPARATOR: char = '.';

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Configuration problems. All of them are reported before any backend starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default)]
    pub system_prompt: SystemPromptConfig,
    /// Upper bound on model round-trips for a single query.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub discovery_policy: DiscoveryPolicy,
    #[serde(default)]
    pub local_programs: Vec<LocalProgramConfig>,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    /// Directory relative paths are resolved against. Set by the loader.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Where the system prompt comes from. `from_file` wins when both are set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemPromptConfig {
    #[serde(default)]
    pub from_string: Option<String>,
    #[serde(default)]
    pub from_file: Option<String>,
}

/// A tool backend started as a local subprocess speaking MCP over stdio.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalProgramConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A tool backend started as a container speaking MCP over its attached stdio.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// Argument blocks, flattened in order into the container command.
    #[serde(default)]
    pub args: Vec<Vec<String>>,
    #[serde(default)]
    pub env: Vec<EnvEntry>,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    /// Defaults to the directory holding the config file.
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

fn default_model() -> String {
    "ministral-3:3b".into()
}

fn default_ollama_url() -> String {
    std::env::var("OLLAMA_HOST")
        .ok()
        .filter(|h| !h.is_empty())
        .map(|h| {
            if h.starts_with("http://") || h.starts_with("https://") {
                h
            } else {
                format!("http://{h}")
            }
        })
        .unwrap_or_else(|| "http://localhost:11434".into())
}

fn default_max_turns() -> usize {
    16
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            ollama_url: default_ollama_url(),
            system_prompt: SystemPromptConfig::default(),
            max_turns: default_max_turns(),
            discovery_policy: DiscoveryPolicy::default(),
            local_programs: Vec::new(),
            containers: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load, interpolate, parse and validate a configuration file.
pub fn load_agent_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = parse_agent_config(&raw, base_dir)?;
    tracing::debug!(
        path = %path.display(),
        local_programs = config.local_programs.len(),
        containers = config.containers.len(),
        "loaded agent config"
    );
    Ok(config)
}

/// Parse configuration text, resolving relative paths against `base_dir`.
pub fn parse_agent_config(raw: &str, base_dir: PathBuf) -> Result<AgentConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    // An empty document is a valid "no backends" config.
    let mut config: AgentConfig = if interpolated.trim().is_empty() {
        AgentConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?
    };
    config.base_dir = base_dir;
    config.validate()?;
    Ok(config)
}

impl AgentConfig {
    /// Reject configurations that cannot work before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(invalid("max_turns must be at least 1"));
        }

        let mut seen = HashSet::new();
        let names = self
            .local_programs
            .iter()
            .map(|lp| lp.name.as_str())
            .chain(self.containers.iter().map(|c| c.name.as_str()));
        for name in names {
            if name.is_empty() {
                return Err(invalid("backend name must not be empty"));
            }
            if name.contains(NAMESPACE_SEPARATOR) {
                return Err(invalid(format!(
                    "backend name '{name}' must not contain '{NAMESPACE_SEPARATOR}'"
                )));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate backend name '{name}'")));
            }
        }

        for lp in &self.local_programs {
            if lp.program.is_empty() {
                return Err(invalid(format!("local program '{}' has no program", lp.name)));
            }
        }

        for container in &self.containers {
            if container.image.is_empty() {
                return Err(invalid(format!("container '{}' has no image", container.name)));
            }
            for entry in &container.env {
                entry.validate().map_err(|reason| {
                    invalid(format!("container '{}': {reason}", container.name))
                })?;
            }
            for mount in &container.mounts {
                if mount.source.is_empty() || mount.target.is_empty() {
                    return Err(invalid(format!(
                        "container '{}': mount needs both source and target",
                        container.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve the system prompt text.
    pub fn system_prompt(&self) -> Result<String, ConfigError> {
        if let Some(file) = self.system_prompt.from_file.as_deref().filter(|f| !f.is_empty()) {
            let path = self.resolve_path(file);
            return std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
        Ok(self
            .system_prompt
            .from_string
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into()))
    }

    pub fn local_program_specs(&self) -> Vec<LocalProgramSpec> {
        self.local_programs
            .iter()
            .map(|lp| LocalProgramSpec {
                name: lp.name.clone(),
                program: lp.program.clone(),
                args: lp.args.clone(),
            })
            .collect()
    }

    pub fn container_specs(&self) -> Vec<ContainerSpec> {
        self.containers
            .iter()
            .map(|c| ContainerSpec {
                name: c.name.clone(),
                image: c.image.clone(),
                args: c.args.clone(),
                env: c.env.clone(),
                mounts: c.mounts.clone(),
                working_directory: match c.working_directory.as_deref() {
                    Some(wd) if !wd.is_empty() => self.resolve_path(wd),
                    _ => self.base_dir.clone(),
                },
                verbose: c.verbose,
            })
            .collect()
    }

    fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = PathBuf::from(expand_tilde(raw));
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        }
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
