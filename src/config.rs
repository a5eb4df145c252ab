use std::path::{Path, PathBuf};

use image::Rgba;
use crate::brush::ColorMixMode;

/// Tunables of the editing engine, persisted as a line-oriented
/// `key=value` file.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Undo depth. Oldest snapshots are evicted past this.
    pub history_capacity: usize,
    /// Per-channel RGB distance accepted by the magic wand.
    pub wand_tolerance: u8,
    /// Per-channel distance separating colour clusters in bleed mode.
    pub bleed_threshold: u8,
    pub autosave_delay_ms: u64,
    pub thumbnail_max_edge: u32,
    pub default_width: u32,
    pub default_height: u32,
    pub default_layer_name: String,
    /// Fill for new documents and for layers decoded without pixel data.
    pub default_fill: [u8; 4],
    pub color_mix_mode: ColorMixMode,
    /// Grab radius of the transform overlay's corner handles, in canvas px.
    pub handle_radius: f32,
    pub ants_dash_step: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            history_capacity: 20,
            wand_tolerance: 32,
            bleed_threshold: 30,
            autosave_delay_ms: 2000,
            thumbnail_max_edge: 512,
            default_width: 800,
            default_height: 600,
            default_layer_name: "Background".to_string(),
            default_fill: [0, 0, 0, 0],
            color_mix_mode: ColorMixMode::Normal,
            handle_radius: 8.0,
            ants_dash_step: 1.0,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/layerpaint/layerpaint_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\LayerPaint\layerpaint_settings.cfg
    /// On macOS:   ~/Library/Application Support/LayerPaint/layerpaint_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("LayerPaint").join("layerpaint_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("LayerPaint")
                    .join("layerpaint_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("layerpaint").join("layerpaint_settings.cfg"))
        }
    }

    pub fn default_fill_color(&self) -> Rgba<u8> {
        Rgba(self.default_fill)
    }

    fn color_to_str(c: [u8; 4]) -> String {
        format!("{},{},{},{}", c[0], c[1], c[2], c[3])
    }

    fn str_to_color(s: &str) -> Option<[u8; 4]> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return None;
        }
        let mut out = [0u8; 4];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = part.trim().parse().ok()?;
        }
        Some(out)
    }

    /// Control characters would split or corrupt a `key=value` line, so
    /// they are written as spaces.
    fn single_line(value: &str) -> String {
        value.chars().map(|c| if c.is_control() { ' ' } else { c }).collect()
    }

    /// Write every key to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mix = match self.color_mix_mode {
            ColorMixMode::Normal => "normal",
            ColorMixMode::Spectral => "spectral",
        };
        let content = format!(
            "history_capacity={}\n\
             wand_tolerance={}\n\
             bleed_threshold={}\n\
             autosave_delay_ms={}\n\
             thumbnail_max_edge={}\n\
             default_width={}\n\
             default_height={}\n\
             default_layer_name={}\n\
             default_fill={}\n\
             color_mix_mode={mix}\n\
             handle_radius={}\n\
             ants_dash_step={}\n",
            self.history_capacity,
            self.wand_tolerance,
            self.bleed_threshold,
            self.autosave_delay_ms,
            self.thumbnail_max_edge,
            self.default_width,
            self.default_height,
            Self::single_line(&self.default_layer_name),
            Self::color_to_str(self.default_fill),
            self.handle_radius,
            self.ants_dash_step,
        );
        std::fs::write(path, content)
    }

    /// Load settings from disk (returns default if file missing or corrupt).
    /// Unknown keys and unparsable values are skipped one by one.
    pub fn load(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else { return Self::default() };

        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "history_capacity" => {
                    if let Ok(v) = val.parse::<usize>() { s.history_capacity = v.max(1); }
                }
                "wand_tolerance" => {
                    if let Ok(v) = val.parse() { s.wand_tolerance = v; }
                }
                "bleed_threshold" => {
                    if let Ok(v) = val.parse() { s.bleed_threshold = v; }
                }
                "autosave_delay_ms" => {
                    if let Ok(v) = val.parse() { s.autosave_delay_ms = v; }
                }
                "thumbnail_max_edge" => {
                    if let Ok(v) = val.parse::<u32>() { s.thumbnail_max_edge = v.max(1); }
                }
                "default_width" => {
                    if let Ok(v) = val.parse::<u32>() { s.default_width = v.max(1); }
                }
                "default_height" => {
                    if let Ok(v) = val.parse::<u32>() { s.default_height = v.max(1); }
                }
                "default_layer_name" => {
                    if !val.is_empty() { s.default_layer_name = val.to_string(); }
                }
                "default_fill" => {
                    if let Some(c) = Self::str_to_color(val) { s.default_fill = c; }
                }
                "color_mix_mode" => {
                    s.color_mix_mode = match val {
                        "spectral" => ColorMixMode::Spectral,
                        _ => ColorMixMode::Normal,
                    };
                }
                "handle_radius" => {
                    if let Ok(v) = val.parse::<f32>() && v.is_finite() && v > 0.0 { s.handle_radius = v; }
                }
                "ants_dash_step" => {
                    if let Ok(v) = val.parse::<f32>() && v.is_finite() { s.ants_dash_step = v; }
                }
                _ => {}
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = EngineSettings::load(&dir.path().join("nope.cfg"));
        assert_eq!(s, EngineSettings::default());
        assert_eq!(s.history_capacity, 20);
        assert_eq!(s.wand_tolerance, 32);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("settings.cfg");
        let mut s = EngineSettings::default();
        s.history_capacity = 7;
        s.default_fill = [255, 255, 255, 255];
        s.color_mix_mode = ColorMixMode::Spectral;
        s.default_layer_name = "Paper".into();
        s.save(&path).unwrap();
        assert_eq!(EngineSettings::load(&path), s);
    }

    #[test]
    fn layer_name_with_newline_stays_on_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.cfg");
        let mut s = EngineSettings::default();
        s.default_layer_name = "Paper\nwand_tolerance=0\r\tsheet".into();
        s.wand_tolerance = 40;
        s.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 12);
        let loaded = EngineSettings::load(&path);
        assert_eq!(loaded.default_layer_name, "Paper wand_tolerance=0  sheet");
        assert_eq!(loaded.wand_tolerance, 40);
    }

    #[test]
    fn bad_values_fall_back_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.cfg");
        std::fs::write(&path, "wand_tolerance=banana\nbleed_threshold=12\nnot a line\nfoo=bar\n").unwrap();
        let s = EngineSettings::load(&path);
        assert_eq!(s.wand_tolerance, 32);
        assert_eq!(s.bleed_threshold, 12);
    }
}
