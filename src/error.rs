use std::fmt;

#[derive(Debug)]
pub enum FrameGenError {
    /// The throwaway device/swap chain used to read dispatch tables could
    /// not be created.
    ProbeDeviceCreation(String),

    /// A dispatch-table slot held a null function pointer.
    MissingFunctionAddress(&'static str),

    /// Changing page protection around a dispatch-table slot failed.
    ProtectionToggle(String),

    /// A slot already points at the replacement, but this patcher holds no
    /// record of the original it replaced.
    AlreadyPatched(&'static str),

    CaptureFailed(String),

    UnsupportedFormat(String),

    /// The source texture was not allocated with cross-device sharing.
    NotShareable,

    QueryFailed(String),

    HandleCreationFailed(String),

    /// The secondary accelerator has not finished initializing.
    NotReady,

    BufferCreationFailed(String),

    ExecutionFailed(String),

    ReadbackFailed(String),

    /// Two frames passed to a combine call disagree on size or format.
    FrameMismatch(String),

    BufferOverflow,

    InvalidConfig(String),

    Platform(anyhow::Error),
}

/// Coarse grouping of failures, used to decide between aborting activation
/// and skipping a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameGenErrorClass {
    /// Hooks cannot be installed; the host keeps running unhooked.
    Activation,
    /// The current frame is dropped and the pipeline moves on.
    PerFrame,
    InvalidInput,
    Fatal,
}

impl FrameGenError {
    pub fn class(&self) -> FrameGenErrorClass {
        match self {
            Self::ProbeDeviceCreation(_)
            | Self::MissingFunctionAddress(_)
            | Self::ProtectionToggle(_)
            | Self::AlreadyPatched(_) => FrameGenErrorClass::Activation,
            Self::CaptureFailed(_)
            | Self::UnsupportedFormat(_)
            | Self::NotShareable
            | Self::QueryFailed(_)
            | Self::HandleCreationFailed(_)
            | Self::NotReady
            | Self::BufferCreationFailed(_)
            | Self::ExecutionFailed(_)
            | Self::ReadbackFailed(_)
            | Self::FrameMismatch(_) => FrameGenErrorClass::PerFrame,
            Self::InvalidConfig(_) => FrameGenErrorClass::InvalidInput,
            Self::BufferOverflow | Self::Platform(_) => FrameGenErrorClass::Fatal,
        }
    }

    pub fn is_per_frame(&self) -> bool {
        matches!(self.class(), FrameGenErrorClass::PerFrame)
    }

    pub fn is_activation_failure(&self) -> bool {
        matches!(self.class(), FrameGenErrorClass::Activation)
    }
}

impl fmt::Display for FrameGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProbeDeviceCreation(message) => {
                write!(f, "failed to create probe device: {message}")
            }
            Self::MissingFunctionAddress(name) => {
                write!(f, "dispatch table slot for {name} is empty")
            }
            Self::ProtectionToggle(message) => {
                write!(f, "failed to change page protection: {message}")
            }
            Self::AlreadyPatched(name) => {
                write!(f, "{name} is already redirected by an unknown patch")
            }
            Self::CaptureFailed(message) => write!(f, "frame capture failed: {message}"),
            Self::UnsupportedFormat(fmt_name) => {
                write!(f, "unsupported back buffer format: {fmt_name}")
            }
            Self::NotShareable => {
                write!(f, "texture was not created with cross-device share capability")
            }
            Self::QueryFailed(message) => write!(f, "texture property query failed: {message}"),
            Self::HandleCreationFailed(message) => {
                write!(f, "shared handle creation failed: {message}")
            }
            Self::NotReady => write!(f, "secondary accelerator is not initialized"),
            Self::BufferCreationFailed(message) => {
                write!(f, "accelerator buffer creation failed: {message}")
            }
            Self::ExecutionFailed(message) => write!(f, "kernel execution failed: {message}"),
            Self::ReadbackFailed(message) => write!(f, "accelerator readback failed: {message}"),
            Self::FrameMismatch(message) => write!(f, "frames cannot be combined: {message}"),
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::InvalidConfig(message) => write!(f, "invalid configuration: {message}"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for FrameGenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type FrameGenResult<T> = Result<T, FrameGenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_failures_are_classified_separately_from_frame_failures() {
        assert!(FrameGenError::MissingFunctionAddress("Present").is_activation_failure());
        assert!(FrameGenError::ProtectionToggle("denied".into()).is_activation_failure());
        assert!(FrameGenError::AlreadyPatched("Present").is_activation_failure());
        assert!(FrameGenError::NotShareable.is_per_frame());
        assert!(FrameGenError::CaptureFailed("lost".into()).is_per_frame());
        assert!(!FrameGenError::BufferOverflow.is_per_frame());
        assert_eq!(
            FrameGenError::InvalidConfig("x".into()).class(),
            FrameGenErrorClass::InvalidInput
        );
    }

    #[test]
    fn platform_errors_expose_their_source() {
        use std::error::Error;
        let err = FrameGenError::Platform(anyhow::anyhow!("device removed"));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "device removed");
    }
}
