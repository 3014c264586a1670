//! Status and action LEDs.
//!
//! The status LED is lit while producers are alive (Running or Paused). The action LED
//! lights on every rising discrete edge and gives a short blink on every telemetry frame.
//! Falling edges leave it alone.
//! Indicators are purely cosmetic: the driver reacts to session snapshots and activity
//! events but never feeds anything back into the session.

use crate::data::record::{ActivityEvent, Transition};
use crate::hardware::capabilities::DigitalOutput;
use crate::session::state::SessionSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Length of the blink emitted for a telemetry frame.
pub const FRAME_PULSE: Duration = Duration::from_millis(5);

/// Drives the two indicator outputs.
pub struct IndicatorDriver {
    status: Arc<dyn DigitalOutput>,
    action: Arc<dyn DigitalOutput>,
    pulse: Duration,
}

impl IndicatorDriver {
    /// Create a driver for the given status and action outputs.
    pub fn new(status: Arc<dyn DigitalOutput>, action: Arc<dyn DigitalOutput>) -> Self {
        Self {
            status,
            action,
            pulse: FRAME_PULSE,
        }
    }

    /// Run until the session or the activity channel goes away.
    ///
    /// Output failures are logged and otherwise ignored.
    pub async fn run(
        self,
        mut session: watch::Receiver<SessionSnapshot>,
        mut activity: broadcast::Receiver<ActivityEvent>,
    ) {
        let initial = session.borrow_and_update().state.has_producers();
        self.drive(&self.status, initial).await;
        self.drive(&self.action, false).await;

        loop {
            tokio::select! {
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let lit = session.borrow_and_update().state.has_producers();
                    self.drive(&self.status, lit).await;
                }
                event = activity.recv() => match event {
                    Ok(ActivityEvent::Frame) => {
                        self.drive(&self.action, true).await;
                        tokio::time::sleep(self.pulse).await;
                        self.drive(&self.action, false).await;
                    }
                    Ok(ActivityEvent::Edge { transition: Transition::Rising, .. }) => {
                        self.drive(&self.action, true).await;
                    }
                    Ok(ActivityEvent::Edge { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Indicator lagging behind activity");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.drive(&self.status, false).await;
        self.drive(&self.action, false).await;
    }

    async fn drive(&self, output: &Arc<dyn DigitalOutput>, level: bool) {
        if let Err(e) = output.set(level).await {
            warn!(error = %e, "Failed to drive indicator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockDigitalOutput;
    use crate::session::state::SessionState;

    #[tokio::test]
    async fn test_status_follows_session_and_action_follows_rising_edges() {
        let status = Arc::new(MockDigitalOutput::new());
        let action = Arc::new(MockDigitalOutput::new());
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (activity_tx, activity_rx) = broadcast::channel(16);

        let driver = IndicatorDriver::new(status.clone(), action.clone());
        let task = tokio::spawn(driver.run(state_rx, activity_rx));

        state_tx.send_modify(|s| s.state = SessionState::Running);
        activity_tx
            .send(ActivityEvent::Edge {
                channel_id: "A".into(),
                transition: Transition::Rising,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(status.level().await, Some(true));
        assert_eq!(action.level().await, Some(true));

        activity_tx
            .send(ActivityEvent::Edge {
                channel_id: "A".into(),
                transition: Transition::Falling,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(action.level().await, Some(true));
        assert_eq!(action.history().await, vec![false, true]);

        state_tx.send_modify(|s| s.state = SessionState::Stopped);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(status.level().await, Some(false));

        drop(state_tx);
        task.await.unwrap();
        assert_eq!(action.level().await, Some(false));
    }
}
