use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::env_config::{
    env_var_bool, env_var_f64, env_var_lowercase, env_var_positive_u64,
};
use crate::error::{FrameGenError, FrameGenResult};
use crate::logging::LogLevel;

/// PCI vendor ids as reported by the adapter enumeration.
pub const VENDOR_ID_AMD: u32 = 0x1002;
pub const VENDOR_ID_NVIDIA: u32 = 0x10DE;
pub const VENDOR_ID_INTEL: u32 = 0x8086;

/// Which vendor's device should run the frame-combination kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcceleratorVendor {
    #[default]
    Amd,
    Nvidia,
    Intel,
    /// Take the first enumerated platform without a degraded-mode warning.
    Any,
}

impl AcceleratorVendor {
    pub const fn vendor_id(self) -> Option<u32> {
        match self {
            Self::Amd => Some(VENDOR_ID_AMD),
            Self::Nvidia => Some(VENDOR_ID_NVIDIA),
            Self::Intel => Some(VENDOR_ID_INTEL),
            Self::Any => None,
        }
    }

    /// Vendor strings a platform or adapter name may carry for this vendor.
    pub const fn name_markers(self) -> &'static [&'static str] {
        match self {
            Self::Amd => &["amd", "advanced micro devices", "radeon"],
            Self::Nvidia => &["nvidia", "geforce"],
            Self::Intel => &["intel"],
            Self::Any => &[],
        }
    }

    pub fn matches(self, vendor_id: u32, name: &str) -> bool {
        if self.vendor_id() == Some(vendor_id) {
            return true;
        }
        let lowered = name.to_ascii_lowercase();
        self.name_markers()
            .iter()
            .any(|marker| lowered.contains(marker))
    }
}

impl FromStr for AcceleratorVendor {
    type Err = FrameGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd" => Ok(Self::Amd),
            "nvidia" => Ok(Self::Nvidia),
            "intel" => Ok(Self::Intel),
            "any" | "auto" => Ok(Self::Any),
            other => Err(FrameGenError::InvalidConfig(format!(
                "unknown accelerator vendor '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AcceleratorVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Amd => "amd",
            Self::Nvidia => "nvidia",
            Self::Intel => "intel",
            Self::Any => "any",
        };
        f.write_str(value)
    }
}

/// Runtime configuration for the interception pipeline.
#[derive(Clone, Debug)]
pub struct FrameGenConfig {
    /// Running-average interception overhead above which augmentation is
    /// switched off for the rest of the process lifetime.
    pub latency_threshold_ms: f64,
    /// Weight of the current frame in the combined output, in `[0, 1]`.
    pub blend_factor: f32,
    pub preferred_vendor: AcceleratorVendor,
    /// Maximum frames waiting for the worker. `None` means unbounded. When
    /// full, the oldest queued frame is dropped.
    pub queue_capacity: Option<usize>,
    /// Sleep between polls when the queue is empty.
    pub worker_idle_sleep: Duration,
    /// Delay between DLL attach and hook installation, giving the host time
    /// to create its own device.
    pub startup_delay: Duration,
    /// Frames to skip after a failed accelerator initialization before the
    /// next attempt.
    pub accelerator_retry_frames: u64,
    /// Block the presenting thread until the readback copy lands.
    pub wait_for_copy: bool,
    pub log_level: LogLevel,
    pub log_to_file: bool,
}

impl Default for FrameGenConfig {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 16.0,
            blend_factor: 0.5,
            preferred_vendor: AcceleratorVendor::Amd,
            queue_capacity: Some(4),
            worker_idle_sleep: Duration::from_millis(1),
            startup_delay: Duration::from_secs(3),
            accelerator_retry_frames: 120,
            wait_for_copy: false,
            log_level: LogLevel::Info,
            log_to_file: true,
        }
    }
}

impl FrameGenConfig {
    /// Defaults overridden by `CROSSLINK_*` environment variables.
    pub fn from_env() -> FrameGenResult<Self> {
        let mut config = Self::default();

        if let Some(value) = env_var_f64("CROSSLINK_LATENCY_THRESHOLD_MS") {
            config.latency_threshold_ms = value;
        }
        if let Some(value) = env_var_f64("CROSSLINK_BLEND_FACTOR") {
            config.blend_factor = value as f32;
        }
        if let Some(value) = env_var_lowercase("CROSSLINK_ACCEL_VENDOR") {
            config.preferred_vendor = value.parse()?;
        }
        if let Some(value) = env_var_lowercase("CROSSLINK_QUEUE_CAPACITY") {
            config.queue_capacity = parse_queue_capacity(&value)?;
        }
        if let Some(ms) = env_var_positive_u64("CROSSLINK_WORKER_IDLE_MS") {
            config.worker_idle_sleep = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var_lowercase("CROSSLINK_STARTUP_DELAY_MS") {
            let ms = ms.parse::<u64>().map_err(|_| {
                FrameGenError::InvalidConfig(format!("startup delay '{ms}' is not an integer"))
            })?;
            config.startup_delay = Duration::from_millis(ms);
        }
        if let Some(frames) = env_var_positive_u64("CROSSLINK_ACCEL_RETRY_FRAMES") {
            config.accelerator_retry_frames = frames;
        }
        if let Some(wait) = env_var_bool("CROSSLINK_WAIT_FOR_COPY") {
            config.wait_for_copy = wait;
        }
        if let Some(level) = env_var_lowercase("CROSSLINK_LOG") {
            config.log_level = level
                .parse()
                .map_err(FrameGenError::InvalidConfig)?;
        }
        if let Some(to_file) = env_var_bool("CROSSLINK_LOG_TO_FILE") {
            config.log_to_file = to_file;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FrameGenResult<()> {
        if !self.latency_threshold_ms.is_finite() || self.latency_threshold_ms <= 0.0 {
            return Err(FrameGenError::InvalidConfig(format!(
                "latency threshold must be positive, got {}",
                self.latency_threshold_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.blend_factor) {
            return Err(FrameGenError::InvalidConfig(format!(
                "blend factor must be within [0, 1], got {}",
                self.blend_factor
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(FrameGenError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.worker_idle_sleep.is_zero() {
            return Err(FrameGenError::InvalidConfig(
                "worker idle sleep must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// `"unbounded"` (or `"none"`) disables the bound; anything else must be a
/// positive integer.
pub(crate) fn parse_queue_capacity(raw: &str) -> FrameGenResult<Option<usize>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "unbounded" | "none" => Ok(None),
        value => match value.parse::<usize>() {
            Ok(capacity) if capacity > 0 => Ok(Some(capacity)),
            _ => Err(FrameGenError::InvalidConfig(format!(
                "queue capacity '{value}' is not a positive integer"
            ))),
        },
    }
}
