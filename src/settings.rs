use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TileError};
use crate::measure::{Rect, Unit};
use crate::pixel::PixelFormat;
use crate::scheduler::Scheduler;
use crate::tiles::{
    DEFAULT_DECODE_CACHE, DEFAULT_MAX_TILE_PX, DEFAULT_RENDER_SHAPE, DEFAULT_SCALES,
    DEFAULT_WORKER_RESERVE, TilesConfig, Viewport,
};

pub const CURRENT_VERSION: u32 = 2;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "tilepool";

/// Tuning knobs persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_scales")]
    pub scales: Vec<u32>,

    /// `[columns, rows]` of the render window
    #[serde(default = "default_render_shape")]
    pub render_shape: [usize; 2],

    #[serde(default)]
    pub memory_format: PixelFormat,

    #[serde(default = "default_max_tile_px")]
    pub max_tile_px: u32,

    /// Fixed worker count; derived from the core count when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(default = "default_worker_reserve")]
    pub worker_reserve: usize,

    #[serde(default = "default_decode_cache")]
    pub decode_cache: usize,

    #[serde(default = "default_true")]
    pub prefetch: bool,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_scales() -> Vec<u32> {
    DEFAULT_SCALES.to_vec()
}

fn default_render_shape() -> [usize; 2] {
    [DEFAULT_RENDER_SHAPE.0, DEFAULT_RENDER_SHAPE.1]
}

fn default_max_tile_px() -> u32 {
    DEFAULT_MAX_TILE_PX
}

fn default_worker_reserve() -> usize {
    DEFAULT_WORKER_RESERVE
}

fn default_decode_cache() -> usize {
    DEFAULT_DECODE_CACHE
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            scales: default_scales(),
            render_shape: default_render_shape(),
            memory_format: PixelFormat::default(),
            max_tile_px: default_max_tile_px(),
            workers: None,
            worker_reserve: default_worker_reserve(),
            decode_cache: default_decode_cache(),
            prefetch: true,
        }
    }
}

impl Settings {
    /// Core configuration for a surface shown in a viewport.
    pub fn tiles_config(&self, surface: Rect, viewport: Viewport) -> Result<TilesConfig> {
        let config = TilesConfig {
            scales: self.scales.clone(),
            render_shape: (self.render_shape[0], self.render_shape[1]),
            memory_format: self.memory_format,
            max_tile_px: self.max_tile_px,
            surface,
            viewport,
            workers: self
                .workers
                .unwrap_or_else(|| Scheduler::default_workers(self.worker_reserve)),
            decode_cache: self.decode_cache,
            prefetch: self.prefetch,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no surface could be tiled with.
    pub fn validate(&self) -> Result<()> {
        let probe = Rect::new(0.0, 0.0, 1.0, 1.0, Unit::Point, 72.0);
        self.tiles_config(probe, Viewport::empty()).map(|_| ())
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut settings: Settings = serde_yaml::from_str(content)
            .map_err(|e| TileError::contract(format!("unreadable settings: {e}")))?;
        if settings.version < CURRENT_VERSION {
            migrate_settings(&mut settings);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_yaml(&self) -> String {
        let body = serde_yaml::to_string(self).unwrap_or_else(|e| {
            error!("Failed to serialise settings: {e}");
            String::new()
        });
        format!("{SETTINGS_HEADER}{body}")
    }
}

const SETTINGS_HEADER: &str = r#"# ============================================================================
# tilepool settings
# ============================================================================
# scales:        zoom factors, strictly ascending (grid N renders at dpi * N)
# render_shape:  [columns, rows] of tiles merged into one clip
# max_tile_px:   longest tile edge in pixels
# workers:       background threads (omit to use cores - worker_reserve)

"#;

pub fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Loads settings from `path` (or the default location), writing the
/// defaults there when no file exists yet. Unreadable or invalid files are
/// logged and replaced by defaults in memory.
pub fn load_settings(path: Option<&Path>) -> Settings {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match preferred_config_path() {
            Some(p) => p,
            None => {
                warn!("Could not determine config directory, using default settings");
                return Settings::default();
            }
        },
    };

    if !path.exists() {
        info!("Settings file not found, creating with defaults at {path:?}");
        let settings = Settings::default();
        save_settings_to_file(&settings, &path);
        return settings;
    }
    load_settings_from_path(&path).unwrap_or_default()
}

fn load_settings_from_path(path: &Path) -> Option<Settings> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
            return None;
        }
    };
    let outdated = serde_yaml::from_str::<serde_yaml::Value>(&content)
        .ok()
        .and_then(|v| v.get("version").and_then(serde_yaml::Value::as_u64))
        .is_some_and(|v| v < u64::from(CURRENT_VERSION));

    match Settings::from_yaml(&content) {
        Ok(settings) => {
            debug!("Loaded settings from {path:?}");
            if outdated {
                save_settings_to_file(&settings, path);
            }
            Some(settings)
        }
        Err(e) => {
            error!("Failed to parse settings file {path:?}: {e}");
            None
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    // v1 allowed a zero tile edge meaning "no limit"
    if settings.version < 2 && settings.max_tile_px == 0 {
        settings.max_tile_px = default_max_tile_px();
    }

    settings.version = CURRENT_VERSION;
}

pub fn save_settings_to_file(settings: &Settings, path: &Path) -> bool {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return false;
            }
        }
    }

    match fs::write(path, settings.to_yaml()) {
        Ok(()) => {
            debug!("Saved settings to {path:?}");
            true
        }
        Err(e) => {
            error!("Failed to save settings to {path:?}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_fill_missing_fields() {
        let s = Settings::from_yaml("max_tile_px: 256\n").unwrap();
        assert_eq!(s.max_tile_px, 256);
        assert_eq!(s.scales, DEFAULT_SCALES);
        assert_eq!(s.render_shape, [2, 2]);
        assert!(s.prefetch);
        assert_eq!(s.version, CURRENT_VERSION);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        for bad in [
            "scales: []\n",
            "scales: [4, 2]\n",
            "render_shape: [0, 3]\n",
            "max_tile_px: 0\nversion: 2\n",
            "scales: nope\n",
        ] {
            assert!(
                matches!(
                    Settings::from_yaml(bad),
                    Err(TileError::ContractViolation { .. })
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn old_version_is_migrated_and_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "version: 1\nmax_tile_px: 0\n").unwrap();

        let s = load_settings(Some(&path));
        assert_eq!(s.version, CURRENT_VERSION);
        assert_eq!(s.max_tile_px, DEFAULT_MAX_TILE_PX);

        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains(&format!("version: {CURRENT_VERSION}")));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let s = load_settings(Some(&path));
        assert_eq!(s, Settings::default());
        assert!(path.exists());
        assert_eq!(load_settings(Some(&path)), Settings::default());
    }

    #[test]
    fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let s = Settings {
            scales: vec![1, 3, 9],
            render_shape: [3, 2],
            memory_format: PixelFormat::B8G8R8A8,
            workers: Some(2),
            prefetch: false,
            ..Settings::default()
        };
        assert!(save_settings_to_file(&s, &path));
        assert_eq!(load_settings(Some(&path)), s);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "scales: [3, 1]\n").unwrap();
        assert_eq!(load_settings(Some(&path)), Settings::default());
    }

    #[test]
    fn tiles_config_carries_settings() {
        let s = Settings {
            workers: Some(0),
            ..Settings::default()
        };
        let surface = Rect::new(0.0, 0.0, 210.0, 297.0, Unit::Millimeter, 72.0);
        let viewport = Viewport::new(800.0, 600.0, Unit::Pixel, 96.0);
        let c = s.tiles_config(surface, viewport).unwrap();
        assert_eq!(c.workers, 0);
        assert_eq!(c.render_shape, (2, 2));
        assert_eq!(c.scales, DEFAULT_SCALES);
        assert_eq!(c.viewport, viewport);
    }
}
