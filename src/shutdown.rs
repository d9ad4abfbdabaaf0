//! Process-wide cancellation
//!
//! Every suspension point of the driver (receipt waits, retry backoff,
//! pacing delays, endpoint backoff) sleeps through [`Shutdown::sleep`] so a
//! termination signal interrupts it. In-flight transactions are left alone;
//! no new attempt is issued after cancellation.

use crate::error::{DriverError, DriverResult};

use std::time::Duration;
use tokio::sync::watch;

/// Sending half, held by the signal handler
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half, cloned into every component that suspends
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a linked trigger/receiver pair
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail fast if shutdown was requested
    pub fn check(&self) -> DriverResult<()> {
        if self.is_triggered() {
            Err(DriverError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning `Cancelled` as soon as shutdown fires
    pub async fn sleep(&self, duration: Duration) -> DriverResult<()> {
        self.check()?;

        let mut rx = self.rx.clone();
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = rx.changed() => match changed {
                    Ok(()) if *rx.borrow() => return Err(DriverError::Cancelled),
                    Ok(()) => continue,
                    // Trigger dropped: nobody can cancel us any more
                    Err(_) => {
                        sleep.await;
                        return Ok(());
                    }
                },
            }
        }
    }
}
