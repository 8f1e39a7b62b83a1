use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Process-wide stop condition. Serving components park on `stopped()`; the
/// token is cancelled by SIGINT/SIGTERM or by an explicit `stop()` call.
#[derive(Clone)]
pub struct StopSignal {
	token: CancellationToken,
}

impl StopSignal {
	/// Installs the OS signal watcher and returns the shared handle.
	pub fn install() -> StopSignal {
		let stop = StopSignal::manual();
		let fire = stop.clone();
		tokio::spawn(async move {
			wait_for_os_signal().await;
			fire.stop();
		});
		stop
	}

	/// A handle with no signal watcher attached, for embedders (and tests)
	/// that drive shutdown themselves.
	pub fn manual() -> StopSignal {
		StopSignal {
			token: CancellationToken::new(),
		}
	}

	pub fn stop(&self) {
		self.token.cancel();
	}

	pub async fn stopped(&self) {
		self.token.cancelled().await;
	}
}

#[cfg(unix)]
async fn wait_for_os_signal() {
	use tokio::signal::unix::{SignalKind, signal};

	let (Ok(mut interrupt), Ok(mut terminate)) =
		(signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
	else {
		error!("could not install signal handlers; only an explicit stop will end the process");
		return std::future::pending::<()>().await;
	};
	let name = tokio::select! {
		_ = interrupt.recv() => "SIGINT",
		_ = terminate.recv() => "SIGTERM",
	};
	info!("received {name}, starting shutdown");
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
	if tokio::signal::ctrl_c().await.is_err() {
		error!("could not install signal handlers; only an explicit stop will end the process");
		return std::future::pending::<()>().await;
	}
	info!("received interrupt, starting shutdown");
}
