use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "profile-router", "ProfileRouter")
        .context("Unable to resolve platform config directory")
}

/// User configuration for the profile router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Optional override for the SQLite mapping store.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub chrome: ChromeSettings,
    #[serde(default)]
    pub host: HostSettings,
    /// Expire the cached profile list after this many seconds. Unset keeps it
    /// for the lifetime of the process.
    #[serde(default)]
    pub profile_cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            store_path: None,
            chrome: ChromeSettings::default(),
            host: HostSettings::default(),
            profile_cache_ttl_secs: None,
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl RouterSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings
                .save(path)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Resolve the SQLite file that holds remembered mappings.
    pub fn resolve_store_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.store_path {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("mappings.sqlite"))
    }

    pub fn profile_cache_ttl(&self) -> Option<Duration> {
        self.profile_cache_ttl_secs.map(Duration::from_secs)
    }
}

/// Where Chrome lives and how the host should invoke it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChromeSettings {
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    /// Override for Chrome's `Local State` file.
    #[serde(default)]
    pub local_state: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ChromeSettings {
    /// Resolve Chrome's `Local State` path, defaulting to the platform location.
    pub fn resolve_local_state(&self) -> Result<PathBuf> {
        if let Some(path) = &self.local_state {
            return Ok(path.clone());
        }
        let base = directories::BaseDirs::new().context("Unable to resolve home directory")?;
        let path = if cfg!(target_os = "macos") {
            base.home_dir()
                .join("Library/Application Support/Google/Chrome/Local State")
        } else if cfg!(target_os = "windows") {
            base.data_local_dir()
                .join("Google/Chrome/User Data/Local State")
        } else {
            base.config_dir().join("google-chrome/Local State")
        };
        Ok(path)
    }
}

/// How the router reaches the native host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Host executable. Unset runs the host logic in-process.
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "HostSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HostSettings {
    const fn default_timeout_ms() -> u64 {
        5_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub traces: TraceSettings,
}

/// Controls structured tracing export to local JSON-L files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}
