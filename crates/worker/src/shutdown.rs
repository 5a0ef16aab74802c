//! Signal handling: first SIGINT/SIGTERM requests a graceful drain,
//! a second SIGINT exits immediately.

use tokio::sync::watch;
use tracing::info;

pub fn spawn_signal_handler(cancel_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut signals = 0u32;
        loop {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }

            signals += 1;
            if signals == 1 {
                info!(
                    "shutdown requested; draining buffers and resuming assignments \
                     (signal again to exit immediately)"
                );
                let _ = cancel_tx.send(true);
            } else {
                eprintln!("immediate exit");
                std::process::exit(130);
            }
        }
    });
}
