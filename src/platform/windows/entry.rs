use std::ffi::c_void;

use windows::Win32::Foundation::{BOOL, HINSTANCE, HMODULE, TRUE};
use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

use crate::config::FrameGenConfig;
use crate::env_config::define_env_flag;
use crate::logging::init_logging;

define_env_flag!(enabled_when(augmentation_disabled, "CROSSLINK_DISABLE"));

/// Nothing heavy may run under the loader lock, so attach only spawns the
/// thread that does the real work.
#[unsafe(no_mangle)]
pub extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    if reason == DLL_PROCESS_ATTACH {
        let _ = unsafe { DisableThreadLibraryCalls(HMODULE(module.0)) };
        let _ = std::thread::Builder::new()
            .name("crosslink-fg-init".to_string())
            .spawn(initialize);
    }
    TRUE
}

fn initialize() {
    let config = match FrameGenConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let fallback = FrameGenConfig::default();
            let _ = init_logging(fallback.log_level, fallback.log_to_file);
            tracing::error!(error = %e, "invalid CROSSLINK_* configuration, staying inactive");
            return;
        }
    };

    if let Err(e) = init_logging(config.log_level, config.log_to_file) {
        eprintln!("crosslink-fg: failed to initialize logging: {e:#}");
    }

    if augmentation_disabled() {
        tracing::info!("CROSSLINK_DISABLE is set, not installing hooks");
        return;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        delay_ms = config.startup_delay.as_millis() as u64,
        "crosslink-fg loaded, waiting before hook installation"
    );
    std::thread::sleep(config.startup_delay);

    if let Err(e) = super::hooks::activate(config) {
        tracing::error!(error = %e, class = ?e.class(), "activation failed");
    }
}
