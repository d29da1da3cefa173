use log::error;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Root cancellation signal, cloned into every long-lived task. Each
/// service loop selects `stopped()` against its inputs and returns promptly
/// once any holder calls `stop()`.
#[derive(Clone)]
pub struct Stopper {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopper {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Stopper {
            state: Arc::new(state),
        }
    }

    /// Builds a stopper wired to SIGINT and SIGTERM. Must be called from
    /// within a tokio runtime.
    pub fn hooked_to_signals() -> Self {
        let s = Self::new();
        let local_s = s.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("hooked_to_signals - failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(int) => int,
                Err(e) => {
                    error!("hooked_to_signals - failed to install SIGINT handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = local_s.stopped() => {},
                _ = term.recv() => local_s.stop(),
                _ = int.recv() => local_s.stop(),
            }
        });
        s
    }

    pub fn stop(&self) {
        self.state.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn stopped(&self) {
        let mut r = self.state.subscribe();
        if !*r.borrow_and_update() {
            let _ = r.changed().await;
        }
    }
}
