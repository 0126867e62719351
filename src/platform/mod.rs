use crate::config::FrameGenConfig;
use crate::error::FrameGenResult;
#[cfg(not(target_os = "windows"))]
use crate::error::FrameGenError;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(not(target_os = "windows"))]
fn unsupported_error() -> FrameGenError {
    FrameGenError::Platform(anyhow::anyhow!(
        "frame generation is only supported on Windows"
    ))
}

#[cfg(target_os = "windows")]
pub(crate) fn activate(config: FrameGenConfig) -> FrameGenResult<()> {
    windows::activate(config)
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn activate(_config: FrameGenConfig) -> FrameGenResult<()> {
    Err(unsupported_error())
}

#[cfg(target_os = "windows")]
pub(crate) fn deactivate() -> FrameGenResult<()> {
    windows::deactivate()
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn deactivate() -> FrameGenResult<()> {
    Ok(())
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;

    #[test]
    fn activation_reports_unsupported_platform() {
        let err = activate(FrameGenConfig::default()).unwrap_err();
        assert!(matches!(err, FrameGenError::Platform(_)));
        assert!(deactivate().is_ok());
    }
}
