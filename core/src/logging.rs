use log::LevelFilter;

/// Install the process-wide logger. `RUST_LOG` overrides the default level.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
    if result.is_ok() {
        log::debug!("logging initialized at {}", level);
    }
}
