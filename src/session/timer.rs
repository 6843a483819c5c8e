use std::time::Duration;
use tokio::time::Instant;

/// One-shot deadline owned by an actor loop.
///
/// `fired()` is meant to sit in a `tokio::select!` arm: it pends forever while
/// disarmed, so re-arming or cancelling between loop iterations is enough to
/// reschedule or suppress it.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once the deadline passes, disarming the timer.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Inactivity window for an open session.
///
/// Every `reset` pushes the deadline a full window out; only the latest reset
/// counts.
#[derive(Debug)]
pub struct IdleTimer {
    window: Duration,
    timer: Timer,
}

impl IdleTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timer: Timer::default(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn reset(&mut self) {
        self.timer.arm(self.window);
    }

    pub fn cancel(&mut self) {
        self.timer.cancel();
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    pub async fn expired(&mut self) {
        self.timer.fired().await;
    }
}
