use log::SetLoggerError;

/// Attempt to init an env_logger for marking diagnostics.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(any(feature = "builtin_env_logger", test))] {
            env_logger::Builder::from_env(
                // Only warnings unless RUST_LOG says otherwise.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
            )
            .is_test(cfg!(test))
            .try_init()
        } else {
            Ok(())
        }
    }
}
