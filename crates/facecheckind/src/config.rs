use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "https://finlyapi-production.up.railway.app";

/// Daemon configuration.
///
/// Layered as: built-in defaults, then an optional TOML file, then
/// `FACECHECKIN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Base URL of the attendance API (no trailing slash).
    pub api_base_url: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Period of the detection loop.
    pub poll_interval_ms: u64,
    /// Minimum mean cosine similarity for a face to be attributed to a label.
    pub match_threshold: f32,
    /// Minimum detector score for a face candidate.
    pub detect_score_threshold: f32,
    pub http_timeout_secs: u64,
    /// Number of frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Minimum time between a check-in and the checkout a later recognition
    /// triggers. 0 checks out on the very next recognition.
    pub checkout_after_secs: u64,
    pub speech_enabled: bool,
    /// TTS program, invoked as `<command> -v <voice> <text>`.
    pub speech_command: String,
    pub speech_voice: String,
    /// Spoken on check-in; `{name}` is replaced with the label.
    pub greeting_template: String,
    /// Spoken on checkout; `{name}` is replaced with the label.
    pub farewell_template: String,
    /// Where to write the annotated frame each tick, if anywhere.
    pub overlay_path: Option<PathBuf>,
    pub display_width: u32,
    pub display_height: u32,
    /// Publish the read-only status interface on the session bus.
    pub dbus_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: facecheckin_core::default_model_dir(),
            poll_interval_ms: 3000,
            match_threshold: 0.40,
            detect_score_threshold: 0.5,
            http_timeout_secs: 10,
            warmup_frames: 4,
            checkout_after_secs: 0,
            speech_enabled: true,
            speech_command: "espeak-ng".to_string(),
            speech_voice: "vi".to_string(),
            greeting_template: "Xin chào {name}".to_string(),
            farewell_template: "Xin chào {name}. Chúc bạn buổi tối vui vẻ!".to_string(),
            overlay_path: None,
            display_width: 720,
            display_height: 560,
            dbus_enabled: true,
        }
    }
}

/// On-disk configuration; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_base_url: Option<String>,
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    model_dir: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    match_threshold: Option<f32>,
    detect_score_threshold: Option<f32>,
    http_timeout_secs: Option<u64>,
    warmup_frames: Option<usize>,
    checkout_after_secs: Option<u64>,
    speech_enabled: Option<bool>,
    speech_command: Option<String>,
    speech_voice: Option<String>,
    greeting_template: Option<String>,
    farewell_template: Option<String>,
    overlay_path: Option<PathBuf>,
    display_width: Option<u32>,
    display_height: Option<u32>,
    dbus_enabled: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    /// Load defaults, the config file (if any), then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = config_file_path() {
            config = config.merge_file(&path)?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay the keys present in a TOML file.
    pub fn merge_file(self, path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(self.merge(file))
    }

    fn merge(mut self, file: FileConfig) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        take!(
            api_base_url,
            camera_device,
            camera_width,
            camera_height,
            model_dir,
            poll_interval_ms,
            match_threshold,
            detect_score_threshold,
            http_timeout_secs,
            warmup_frames,
            checkout_after_secs,
            speech_enabled,
            speech_command,
            speech_voice,
            greeting_template,
            farewell_template,
            display_width,
            display_height,
            dbus_enabled,
        );
        if file.overlay_path.is_some() {
            self.overlay_path = file.overlay_path;
        }
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
        self
    }

    /// Apply `FACECHECKIN_*` overrides. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACECHECKIN_API_BASE_URL") {
            self.api_base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = var("FACECHECKIN_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("FACECHECKIN_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACECHECKIN_OVERLAY_PATH") {
            self.overlay_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("FACECHECKIN_SPEECH_COMMAND") {
            self.speech_command = v;
        }
        if let Some(v) = var("FACECHECKIN_SPEECH_VOICE") {
            self.speech_voice = v;
        }
        self.camera_width = parse_var(&var, "FACECHECKIN_CAMERA_WIDTH").unwrap_or(self.camera_width);
        self.camera_height = parse_var(&var, "FACECHECKIN_CAMERA_HEIGHT").unwrap_or(self.camera_height);
        self.poll_interval_ms = parse_var(&var, "FACECHECKIN_POLL_INTERVAL_MS").unwrap_or(self.poll_interval_ms);
        self.match_threshold = parse_var(&var, "FACECHECKIN_MATCH_THRESHOLD").unwrap_or(self.match_threshold);
        self.detect_score_threshold =
            parse_var(&var, "FACECHECKIN_DETECT_SCORE_THRESHOLD").unwrap_or(self.detect_score_threshold);
        self.http_timeout_secs = parse_var(&var, "FACECHECKIN_HTTP_TIMEOUT_SECS").unwrap_or(self.http_timeout_secs);
        self.warmup_frames = parse_var(&var, "FACECHECKIN_WARMUP_FRAMES").unwrap_or(self.warmup_frames);
        self.checkout_after_secs =
            parse_var(&var, "FACECHECKIN_CHECKOUT_AFTER_SECS").unwrap_or(self.checkout_after_secs);
        self.speech_enabled = var("FACECHECKIN_SPEECH_ENABLED")
            .map(|v| v != "0")
            .unwrap_or(self.speech_enabled);
        self.dbus_enabled = var("FACECHECKIN_DBUS_ENABLED")
            .map(|v| v != "0")
            .unwrap_or(self.dbus_enabled);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn checkout_after(&self) -> Duration {
        Duration::from_secs(self.checkout_after_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(facecheckin_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(facecheckin_core::RECOGNIZER_MODEL_FILE)
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.parse().ok())
}

/// `$FACECHECKIN_CONFIG`, else `$XDG_CONFIG_HOME/facecheckin/config.toml` (or
/// `~/.config/...`) when that file exists.
fn config_file_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("FACECHECKIN_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    let candidate = config_home.join("facecheckin/config.toml");
    candidate.exists().then_some(candidate)
}
