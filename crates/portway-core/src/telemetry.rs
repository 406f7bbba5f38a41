use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Respects `RUST_LOG`; defaults to
/// `info`. Safe to call more than once (tests share one process).
pub fn setup_logging() {
	INIT.call_once(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_target(true)
			.init();
	});
}
