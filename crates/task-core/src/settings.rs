use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::request::ModelConfig;

/// Persistent defaults for the runner, stored as JSON in the user config dir.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default)]
    pub model: ModelConfig,
    /// Terminal tasks older than this are pruned. `None` keeps everything.
    #[serde(default)]
    pub retention_hours: Option<u64>,
    /// Cap on concurrently running tasks. `None` means unlimited.
    #[serde(default)]
    pub max_running: Option<usize>,
    #[serde(default)]
    pub engine_url: Option<String>,
}

impl RunnerSettings {
    fn normalize(&mut self) {
        self.model.llm_provider = self.model.llm_provider.trim().to_string();
        self.model.deep_think_llm = self.model.deep_think_llm.trim().to_string();
        self.model.quick_think_llm = self.model.quick_think_llm.trim().to_string();
        let defaults = ModelConfig::default();
        if self.model.llm_provider.is_empty() {
            self.model.llm_provider = defaults.llm_provider;
        }
        if self.model.deep_think_llm.is_empty() {
            self.model.deep_think_llm = defaults.deep_think_llm;
        }
        if self.model.quick_think_llm.is_empty() {
            self.model.quick_think_llm = defaults.quick_think_llm;
        }

        if self.retention_hours == Some(0) {
            self.retention_hours = None;
        }
        if self.max_running == Some(0) {
            self.max_running = None;
        }

        self.engine_url = self.engine_url.as_ref().map(|s| s.trim().to_string());
        if matches!(self.engine_url.as_deref(), Some(s) if s.is_empty()) {
            self.engine_url = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Per-user directory for task state (`$XDG_STATE_HOME/ta-runner`).
pub fn default_state_dir() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_STATE_HOME is set but empty");
        }
        return Ok(dir.join("ta-runner"));
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("state").join("ta-runner"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("ta-runner").join("config.json"))
}

pub fn load_settings() -> anyhow::Result<Option<RunnerSettings>> {
    load_settings_from(&settings_path()?)
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Option<RunnerSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: RunnerSettings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

pub fn save_settings(settings: &RunnerSettings) -> anyhow::Result<()> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &RunnerSettings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
