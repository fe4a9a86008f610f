//! Process-wide TLS verification toggle.

use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable that disables outbound certificate verification.
pub const DISABLE_SSL_VERIFY_ENV: &str = "DISABLE_SSL_VERIFY";

static TLS_VERIFY_DISABLED: AtomicBool = AtomicBool::new(false);

/// Read [`DISABLE_SSL_VERIFY_ENV`] once at startup and set the global flag.
///
/// Only the exact value `true` disables verification. Returns the
/// resulting state.
pub fn init_tls_from_env() -> bool {
    let disabled = std::env::var(DISABLE_SSL_VERIFY_ENV).is_ok_and(|v| v == "true");
    if disabled {
        TLS_VERIFY_DISABLED.store(true, Ordering::SeqCst);
        tracing::warn!(target: "strata", "SSL/TLS certificate verification is disabled globally");
    }
    disabled
}

/// Whether outbound TLS certificate verification is disabled.
pub fn tls_verification_disabled() -> bool {
    TLS_VERIFY_DISABLED.load(Ordering::SeqCst)
}
