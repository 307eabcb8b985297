use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How often a paused engine re-checks the control channel
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Commands a front end can send to running jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Shutdown,
}

/// Per-run control handle shared by the caller and every engine of the run.
///
/// Pause/resume is a level (every engine sees the latest value), shutdown is a
/// one-way latch.
#[derive(Debug, Clone)]
pub struct RunControl {
    paused: Arc<watch::Sender<bool>>,
    shutdown: CancellationToken,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn send(&self, command: ControlCommand) {
        match command {
            ControlCommand::Pause => self.pause(),
            ControlCommand::Resume => self.resume(),
            ControlCommand::Shutdown => self.shutdown(),
        }
    }

    pub fn pause(&self) {
        log::info!("Pause requested");
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        log::info!("Resume requested");
        self.paused.send_replace(false);
    }

    /// Stop dispatching and cancel every running job
    pub fn shutdown(&self) {
        log::info!("Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Receiving side handed to an engine
    pub fn listener(&self) -> ControlListener {
        ControlListener {
            paused: self.paused.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// An engine's view of the control channel
#[derive(Debug, Clone)]
pub struct ControlListener {
    paused: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl ControlListener {
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for the next control change. Shutdown wins over a pause change
    /// arriving at the same time. A dropped sending side never yields a pause change.
    pub async fn changed(&mut self) -> ControlEvent {
        let paused = &mut self.paused;
        let shutdown = &self.shutdown;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => ControlEvent::Shutdown,
            now_paused = async {
                if paused.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
                let now_paused = *paused.borrow_and_update();
                now_paused
            } => {
                if now_paused {
                    ControlEvent::Paused
                } else {
                    ControlEvent::Resumed
                }
            }
        }
    }
}

/// A change observed by a [`ControlListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Paused,
    Resumed,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_is_visible_to_every_listener() {
        let control = RunControl::new();
        let a = control.listener();
        let b = control.clone().listener();
        assert!(!a.is_paused());

        control.send(ControlCommand::Pause);
        assert!(a.is_paused() && b.is_paused());
        assert!(control.is_paused());

        control.send(ControlCommand::Resume);
        assert!(!a.is_paused() && !b.is_paused());
    }

    #[test]
    fn test_shutdown_is_a_latch() {
        let control = RunControl::new();
        let listener = control.listener();
        control.shutdown();
        control.resume();
        assert!(listener.is_shutdown());
        assert!(control.is_shutdown());
    }

    #[test]
    fn test_runs_are_independent() {
        let first = RunControl::new();
        let second = RunControl::new();
        first.pause();
        first.shutdown();
        assert!(!second.is_paused());
        assert!(!second.is_shutdown());
    }

    #[tokio::test]
    async fn test_changed_wakes_listener() {
        let control = RunControl::new();
        let mut listener = control.listener();
        let waiter = tokio::spawn(async move { listener.changed().await });
        tokio::task::yield_now().await;
        control.pause();
        assert_eq!(waiter.await.unwrap(), ControlEvent::Paused);
    }

    #[tokio::test]
    async fn test_changed_reports_shutdown() {
        let control = RunControl::new();
        let mut listener = control.listener();
        control.pause();
        control.shutdown();
        assert_eq!(listener.changed().await, ControlEvent::Shutdown);
        assert!(listener.is_shutdown());
    }
}
