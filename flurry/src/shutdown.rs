//! Ordered, deadline-bounded shutdown.
//!
//! The [`Coordinator`] walks the process through its phases:
//!
//! ```text
//! Running -> Draining -> StatsFlushing -> Closed
//!     \__________\_____________\________> Aborted
//! ```
//!
//! `Draining` is entered on interrupt or end of input. The whole drain, main
//! pipeline and stats pipeline both, must complete within the deadline
//! measured from that moment or the coordinator gives up and reports
//! `Aborted`. The current phase can be watched.

use std::{future::Future, time::Duration};

use tokio::sync::watch;
use tracing::{info, warn};

/// A shutdown phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Input is flowing.
    Running,
    /// Input stopped, the main pipeline is flushing and its workers draining.
    Draining,
    /// The main workers are done, the stats pipeline is flushing.
    StatsFlushing,
    /// Everything drained in time.
    Closed,
    /// The deadline passed before draining finished.
    Aborted,
}

impl Phase {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Aborted)
    }

    /// Process exit code for a terminal phase.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Phase::Aborted => 1,
            Phase::Running | Phase::Draining | Phase::StatsFlushing | Phase::Closed => 0,
        }
    }
}

/// Drives and publishes the shutdown phase.
#[derive(Debug)]
pub struct Coordinator {
    deadline: Duration,
    phase: watch::Sender<Phase>,
}

impl Coordinator {
    /// Create a new [`Coordinator`] in [`Phase::Running`].
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self { deadline, phase }
    }

    /// Watch phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Move to `next`. Terminal phases are never left.
    pub fn advance(&self, next: Phase) {
        self.phase.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            info!("Shutdown phase {current:?} -> {next:?}");
            *current = next;
            true
        });
    }

    /// Enter [`Phase::Draining`] and run `drain` under the deadline.
    ///
    /// `drain` is expected to advance to [`Phase::StatsFlushing`] itself once
    /// the main workers are joined. Returns [`Phase::Closed`] if `drain`
    /// finished in time, [`Phase::Aborted`] otherwise.
    pub async fn drain<F>(&self, drain: F) -> Phase
    where
        F: Future<Output = ()>,
    {
        self.advance(Phase::Draining);
        if tokio::time::timeout(self.deadline, drain).await.is_ok() {
            self.advance(Phase::Closed);
        } else {
            warn!(
                "Shutdown did not finish within {deadline:?} while {phase:?}, aborting",
                deadline = self.deadline,
                phase = self.phase(),
            );
            self.advance(Phase::Aborted);
        }
        self.phase()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completed_drain_closes() {
        let coordinator = Coordinator::new(Duration::from_secs(3));
        let mut phases = coordinator.subscribe();
        assert_eq!(coordinator.phase(), Phase::Running);

        let phase = coordinator
            .drain(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                coordinator.advance(Phase::StatsFlushing);
            })
            .await;

        assert_eq!(phase, Phase::Closed);
        assert_eq!(phase.exit_code(), 0);
        assert!(phases.has_changed().expect("sender alive"));
        assert_eq!(*phases.borrow_and_update(), Phase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_drain_aborts_at_deadline() {
        let coordinator = Coordinator::new(Duration::from_secs(3));
        let start = Instant::now();

        let phase = coordinator.drain(std::future::pending()).await;

        assert_eq!(phase, Phase::Aborted);
        assert_eq!(phase.exit_code(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn terminal_phases_are_final() {
        let coordinator = Coordinator::new(Duration::from_secs(1));
        coordinator.advance(Phase::Draining);
        coordinator.advance(Phase::Aborted);
        coordinator.advance(Phase::Closed);
        assert_eq!(coordinator.phase(), Phase::Aborted);
    }
}
