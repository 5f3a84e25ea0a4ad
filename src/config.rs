use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::LoopOptions;
use crate::detect::{
    DetectionConfig, ServiceConfig, Thresholds, TokenSession, DEFAULT_CONFIDENCE, DEFAULT_IOU,
};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::ingest::CameraConfig;
use crate::overlay::OverlayStyle;
use crate::scheduler::DEFAULT_TICK_INTERVAL;

const DEFAULT_DISPLAY_WIDTH: u32 = 640;
const DEFAULT_DISPLAY_HEIGHT: u32 = 360;
const DEFAULT_LINE_WIDTH: u32 = 3;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LiveDetectConfigFile {
    service: Option<ServiceConfigFile>,
    session: Option<SessionConfigFile>,
    camera: Option<CameraConfigFile>,
    display: Option<DisplayConfigFile>,
    detection: Option<DetectionConfigFile>,
    overlay: Option<OverlayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    url: Option<String>,
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    token: Option<String>,
    token_path: Option<PathBuf>,
    user: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence: Option<f32>,
    iou: Option<f32>,
    interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    font_path: Option<PathBuf>,
    line_width: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LiveDetectConfig {
    pub service: ServiceConfig,
    pub session: SessionSettings,
    pub camera: CameraConfig,
    pub display: DisplaySettings,
    pub detection: DetectionSettings,
    pub overlay: OverlaySettings,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub token: Option<String>,
    pub token_path: Option<PathBuf>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub confidence: f32,
    pub iou: f32,
    pub interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySettings {
    /// Replaces the bundled label font.
    pub font_path: Option<PathBuf>,
    pub line_width: u32,
}

impl LiveDetectConfig {
    /// Load from `$LIVE_DETECT_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVE_DETECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LiveDetectConfigFile) -> Self {
        let service_file = file.service.unwrap_or_default();
        let service_defaults = ServiceConfig::default();
        let service = ServiceConfig {
            url: service_file.url.unwrap_or(service_defaults.url),
            endpoint: service_file.endpoint.unwrap_or(service_defaults.endpoint),
            timeout: service_file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(service_defaults.timeout),
        };

        let session_file = file.session.unwrap_or_default();
        let session = SessionSettings {
            token: session_file.token,
            token_path: session_file.token_path,
            user: session_file.user,
        };

        let camera_file = file.camera.unwrap_or_default();
        let camera_defaults = CameraConfig::default();
        let camera = CameraConfig {
            device: camera_file.device.unwrap_or(camera_defaults.device),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            target_fps: camera_file.target_fps.unwrap_or(camera_defaults.target_fps),
        };

        let display_file = file.display.unwrap_or_default();
        let display = DisplaySettings {
            width: display_file.width.unwrap_or(DEFAULT_DISPLAY_WIDTH),
            height: display_file.height.unwrap_or(DEFAULT_DISPLAY_HEIGHT),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            confidence: detection_file.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            iou: detection_file.iou.unwrap_or(DEFAULT_IOU),
            interval: detection_file
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TICK_INTERVAL),
            jpeg_quality: detection_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let overlay_file = file.overlay.unwrap_or_default();
        let overlay = OverlaySettings {
            font_path: overlay_file.font_path,
            line_width: overlay_file.line_width.unwrap_or(DEFAULT_LINE_WIDTH),
        };

        Self {
            service,
            session,
            camera,
            display,
            detection,
            overlay,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("LIVE_DETECT_SERVICE_URL") {
            if !url.trim().is_empty() {
                self.service.url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("LIVE_DETECT_TOKEN") {
            if !token.trim().is_empty() {
                self.session.token = Some(token.trim().to_string());
            }
        }
        if let Ok(path) = std::env::var("LIVE_DETECT_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.session.token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(device) = std::env::var("LIVE_DETECT_CAMERA") {
            if !device.trim().is_empty() {
                self.camera.device = device.trim().to_string();
            }
        }
        if let Ok(confidence) = std::env::var("LIVE_DETECT_CONFIDENCE") {
            self.detection.confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVE_DETECT_CONFIDENCE must be a number"))?;
        }
        if let Ok(iou) = std::env::var("LIVE_DETECT_IOU") {
            self.detection.iou = iou
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVE_DETECT_IOU must be a number"))?;
        }
        if let Ok(interval) = std::env::var("LIVE_DETECT_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("LIVE_DETECT_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.detection.interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.service.frame_url()?;
        if self.service.timeout.is_zero() {
            return Err(anyhow!("service.timeout_ms must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.display.width == 0 || self.display.height == 0 {
            return Err(anyhow!("display width and height must be greater than zero"));
        }
        for (name, value) in [
            ("confidence", self.detection.confidence),
            ("iou", self.detection.iou),
        ] {
            if !DetectionConfig::is_valid(value) {
                return Err(anyhow!("detection.{} must be within [0.1, 0.9], got {}", name, value));
            }
        }
        if self.detection.interval.is_zero() {
            return Err(anyhow!("detection.interval_ms must be greater than zero"));
        }
        if !(1..=100).contains(&self.detection.jpeg_quality) {
            return Err(anyhow!("detection.jpeg_quality must be within 1..=100"));
        }
        if self.overlay.line_width == 0 {
            return Err(anyhow!("overlay.line_width must be greater than zero"));
        }
        Ok(())
    }

    /// Session from the configured token, or token file.
    ///
    /// With neither configured the session is unauthenticated and detection
    /// refuses to start.
    pub fn session(&self) -> Result<TokenSession> {
        let user = self.session.user.clone();
        if let Some(token) = &self.session.token {
            return Ok(TokenSession::new(Some(token.clone()), user));
        }
        match &self.session.token_path {
            Some(path) => TokenSession::from_token_file(path, user),
            None => Ok(TokenSession::new(None, user)),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(DetectionConfig::new(
            self.detection.confidence,
            self.detection.iou,
        ))
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            interval: self.detection.interval,
            jpeg_quality: self.detection.jpeg_quality,
            style: OverlayStyle {
                line_width: self.overlay.line_width,
                ..OverlayStyle::default()
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<LiveDetectConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
