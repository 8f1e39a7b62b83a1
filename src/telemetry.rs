use std::{env, io};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// One-shot logging init. `gateway_log` selects the sink: `prod`, `test` and
/// `dev` write daily-rolled files under `./logs/`, anything else writes to
/// stderr. Level comes from the usual `RUST_LOG` filter, defaulting to info.
pub fn setup_logging() {
	INIT.get_or_init(|| {
		let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
		match env::var("gateway_log").ok().as_deref() {
			Some("prod" | "test" | "dev") => {
				let appender = tracing_appender::rolling::daily("./logs", "meshgate.log");
				let (writer, guard) = tracing_appender::non_blocking(appender);
				tracing_subscriber::fmt()
					.with_env_filter(filter)
					.with_writer(writer)
					.with_ansi(false)
					.init();
				Some(guard)
			},
			_ => {
				tracing_subscriber::fmt()
					.with_env_filter(filter)
					.with_writer(io::stderr)
					.with_ansi(false)
					.init();
				None
			},
		}
	});
}
