//! Per-pass configuration snapshots and the flags the engine writes back.

use crate::config::{format_for, ConfigFormat, FdegateConfig};
use crate::error::{FdegateError, FdegateResult};
use crate::recovery::write_private;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Source of configuration for decision passes.
///
/// Every pass takes one `snapshot()` and treats it as immutable. Writes are
/// limited to the rotation flag and the escrow timestamp.
pub trait PreferenceSource {
    fn snapshot(&self) -> FdegateResult<FdegateConfig>;

    fn mark_key_generated(&self) -> FdegateResult<()>;

    fn reset_key_generated(&self) -> FdegateResult<()>;

    /// Record the last escrow time in unix seconds. Zero queues an escrow.
    fn record_last_escrow(&self, at: u64) -> FdegateResult<()>;
}

/// Values the engine owns. Each one set here replaces the configured value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_rotated: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_escrow: Option<u64>,
}

impl EngineState {
    fn apply(&self, cfg: &mut FdegateConfig) {
        if let Some(rotated) = self.key_rotated {
            cfg.rotation.key_rotated = rotated;
        }
        if let Some(at) = self.last_escrow {
            cfg.escrow.last_escrow = Some(at);
        }
    }
}

/// Reloads the configuration file for each pass. Engine writes go to a
/// `.state` file beside it; the configuration file itself is never rewritten.
#[derive(Debug, Clone)]
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `fdegate.toml` keeps its state in `fdegate.toml.state`.
    pub fn state_path(&self) -> FdegateResult<PathBuf> {
        let name = self.path.file_name().ok_or_else(|| {
            FdegateError::ConfigurationValueMissing(format!(
                "file name in {}",
                self.path.display()
            ))
        })?;
        let mut name = name.to_os_string();
        name.push(".state");
        Ok(self.path.with_file_name(name))
    }

    fn format(&self) -> ConfigFormat {
        format_for(&self.path)
    }

    pub fn load_state(&self) -> FdegateResult<EngineState> {
        let path = self.state_path()?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(EngineState::default()),
            Err(err) => return Err(err.into()),
        };
        Ok(match self.format() {
            ConfigFormat::Toml => toml::from_str(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str(&contents)?,
        })
    }

    fn update_state(&self, apply: impl FnOnce(&mut EngineState)) -> FdegateResult<()> {
        let mut state = self.load_state()?;
        apply(&mut state);
        let payload = match self.format() {
            ConfigFormat::Toml => toml::to_string_pretty(&state)?,
            ConfigFormat::Yaml => serde_yaml::to_string(&state)?,
        };
        let path = self.state_path()?;
        write_private(&path, payload.as_bytes())?;
        info!("engine state written to {}", path.display());
        Ok(())
    }
}

impl PreferenceSource for FilePreferences {
    fn snapshot(&self) -> FdegateResult<FdegateConfig> {
        let mut cfg = FdegateConfig::load(&self.path)?;
        self.load_state()?.apply(&mut cfg);
        Ok(cfg)
    }

    fn mark_key_generated(&self) -> FdegateResult<()> {
        self.update_state(|state| state.key_rotated = Some(true))
    }

    fn reset_key_generated(&self) -> FdegateResult<()> {
        self.update_state(|state| state.key_rotated = Some(false))
    }

    fn record_last_escrow(&self, at: u64) -> FdegateResult<()> {
        self.update_state(|state| state.last_escrow = Some(at))
    }
}

/// In-process preferences, used by drills and tests.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    inner: Mutex<FdegateConfig>,
}

impl MemoryPreferences {
    pub fn new(config: FdegateConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut FdegateConfig)) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut guard);
    }
}

impl PreferenceSource for MemoryPreferences {
    fn snapshot(&self) -> FdegateResult<FdegateConfig> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }

    fn mark_key_generated(&self) -> FdegateResult<()> {
        self.update(|cfg| cfg.rotation.key_rotated = true);
        Ok(())
    }

    fn reset_key_generated(&self) -> FdegateResult<()> {
        self.update(|cfg| cfg.rotation.key_rotated = false);
        Ok(())
    }

    fn record_last_escrow(&self, at: u64) -> FdegateResult<()> {
        self.update(|cfg| cfg.escrow.last_escrow = Some(at));
        Ok(())
    }
}

impl<T: PreferenceSource + ?Sized> PreferenceSource for &T {
    fn snapshot(&self) -> FdegateResult<FdegateConfig> {
        (**self).snapshot()
    }

    fn mark_key_generated(&self) -> FdegateResult<()> {
        (**self).mark_key_generated()
    }

    fn reset_key_generated(&self) -> FdegateResult<()> {
        (**self).reset_key_generated()
    }

    fn record_last_escrow(&self, at: u64) -> FdegateResult<()> {
        (**self).record_last_escrow(at)
    }
}
