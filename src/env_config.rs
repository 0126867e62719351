/// Centralized environment-variable parsing helpers.
///
/// Every `CROSSLINK_*` read goes through these helpers so the truthy/falsey
/// parsing logic lives in exactly one place.

/// Returns `true` when the environment variable is set to a truthy value
/// (`1`, `true`, `yes`, or `on`, case-insensitive, trimmed).
#[inline]
pub(crate) fn env_var_truthy(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|raw| parse_truthy(&raw))
        .unwrap_or(false)
}

/// Like [`env_var_truthy`], but distinguishes "unset" from "set to a falsey
/// value" so callers can keep their own default.
#[inline]
pub(crate) fn env_var_bool(var_name: &str) -> Option<bool> {
    std::env::var(var_name).ok().map(|raw| parse_truthy(&raw))
}

fn parse_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

/// Parses the environment variable as a `u64`, returning `Some` only when
/// the value is a valid positive (> 0) integer.
#[inline]
pub(crate) fn env_var_positive_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Parses the environment variable as a finite `f64`.
#[inline]
pub(crate) fn env_var_f64(var_name: &str) -> Option<f64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Returns the trimmed, lowercased value of the environment variable, or
/// `None` when unset or empty.
#[inline]
pub(crate) fn env_var_lowercase(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|raw| raw.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

/// Declares a cached boolean flag backed by a `OnceLock<bool>`.
///
/// `enabled_when(fn_name, "ENV_VAR")` returns `true` only when the env var
/// is truthy. The value is read once per process.
macro_rules! define_env_flag {
    (enabled_when($fn_name:ident, $var:expr)) => {
        #[inline]
        fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| $crate::env_config::env_var_truthy($var))
        }
    };
}

pub(crate) use define_env_flag;
