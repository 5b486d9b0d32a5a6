//! Language profile registry.
//!
//! The catalog is a deploy-time artifact (`config/languages.json`): adding a
//! language means adding a profile entry and building its pinned image,
//! never shipping new control flow. The registry is read-only after startup
//! and shared between the API (admission) and the worker (execution).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// A single denylist entry checked by the static policy validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyRule {
    pub category: String,
    pub pattern: String,
}

/// Untrusted code never gets a network. The field exists so a catalog that
/// asks for anything else is rejected loudly at load time instead of being
/// silently "fixed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Deny,
    Allow,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::Deny
    }
}

fn default_supports_stdin() -> bool {
    true
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_pids_limit() -> i64 {
    64
}

/// Immutable runtime configuration for one supported language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: String,
    pub display_name: String,
    pub version: String,
    /// Pinned container image reference. Never user-supplied.
    pub image: String,
    pub file_extension: String,
    /// Compile step for compiled languages; its wall time counts against
    /// the same budget as the run step.
    #[serde(default)]
    pub compile_command: Option<String>,
    pub run_command: String,
    pub default_timeout_ms: u64,
    pub max_memory_mb: u64,
    pub max_cpus: f64,
    pub max_cpu_time_s: u64,
    #[serde(default)]
    pub network_policy: NetworkPolicy,
    #[serde(default = "default_supports_stdin")]
    pub supports_stdin: bool,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default)]
    pub denylist: Vec<DenyRule>,
}

impl LanguageProfile {
    /// Filename the submitted source is written to inside the workspace.
    pub fn source_file(&self) -> String {
        format!("main.{}", self.file_extension)
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.max_memory_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.max_cpus * 1_000_000_000.0) as i64
    }

    /// Clamp a caller-requested timeout to the profile ceiling.
    pub fn clamp_timeout_ms(&self, requested: Option<u64>) -> u64 {
        match requested {
            Some(ms) if ms > 0 => ms.min(self.default_timeout_ms),
            _ => self.default_timeout_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    languages: Vec<LanguageProfile>,
}

/// Read-only catalog of supported runtimes.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, LanguageProfile>,
}

impl ProfileRegistry {
    /// Load and validate the catalog from `config/languages.json`.
    pub fn load<P: AsRef<Path>>(path: P) -> SandboxResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SandboxError::InvalidCatalog(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let catalog: CatalogFile = serde_json::from_str(&content)
            .map_err(|e| SandboxError::InvalidCatalog(format!("failed to parse catalog: {e}")))?;
        Self::from_profiles(catalog.languages)
    }

    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> SandboxResult<Self> {
        if profiles.is_empty() {
            return Err(SandboxError::InvalidCatalog(
                "no languages configured".to_string(),
            ));
        }

        let mut map = HashMap::new();
        for profile in profiles {
            if profile.network_policy != NetworkPolicy::Deny {
                return Err(SandboxError::InvalidCatalog(format!(
                    "language '{}' requests network access; untrusted code runs network-isolated",
                    profile.id
                )));
            }
            if profile.run_command.trim().is_empty() {
                return Err(SandboxError::InvalidCatalog(format!(
                    "language '{}' has an empty run command",
                    profile.id
                )));
            }
            if map.insert(profile.id.clone(), profile).is_some() {
                return Err(SandboxError::InvalidCatalog(
                    "duplicate language id in catalog".to_string(),
                ));
            }
        }

        Ok(Self { profiles: map })
    }

    pub fn get(&self, language_id: &str) -> SandboxResult<&LanguageProfile> {
        self.profiles
            .get(language_id)
            .ok_or_else(|| SandboxError::UnknownLanguage(language_id.to_string()))
    }

    /// All configured language ids, sorted for deterministic queue order.
    pub fn language_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
