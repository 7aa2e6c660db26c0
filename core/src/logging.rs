//! Idempotent logger initialization.
//!
//! The `TLSPLICE_DEBUG` environment variable (integer, 0–5) raises the
//! crate's verbosity independently of `RUST_LOG`; unset means silent
//! unless the host application configured its own logger.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging (idempotent, only runs once).
pub(crate) fn init() {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        if let Some(level) = debug_level_from_env() {
            builder.filter_module("tlsplice", level);
        }
        // The host may already have installed a logger; that is fine.
        let _ = builder.try_init();
    });
}

fn debug_level_from_env() -> Option<log::LevelFilter> {
    let raw = std::env::var("TLSPLICE_DEBUG").ok()?;
    let level = match raw.trim().parse::<u8>().ok()? {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    Some(level)
}
