//! Wait
//!
//! Suspends for a fixed duration. The wake-up travels through the notify
//! engine exactly like a remote task callback would.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionContext, ExecutionResponse, NotifyResult, State, StateError, StateResponse};
use crate::notify::{NotifyEngine, NotifyOutcome};
use crate::schedule::Scheduler;

/// Persisted so a restarted host can re-arm the timer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WaitStateData {
    pub correlation_id: String,
    pub wakeup_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WaitState {
    duration: Duration,
}

impl WaitState {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

fn arm(scheduler: &Arc<dyn Scheduler>, notify: &Arc<NotifyEngine>, correlation_id: String, delay: Duration) {
    let notify = Arc::clone(notify);
    scheduler.schedule_after(
        delay,
        Box::new(move || match notify.notify(&correlation_id, NotifyResult::success()) {
            Ok(NotifyOutcome::Discarded) => debug!("Timer '{}' fired after abort", correlation_id),
            Ok(_) => debug!("Timer '{}' fired", correlation_id),
            Err(e) => error!("Timer '{}' could not notify: {}", correlation_id, e),
        }),
    );
}

impl State for WaitState {
    fn kind(&self) -> &'static str {
        "wait"
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
        let correlation_id = Uuid::new_v4().to_string();
        let wakeup_at = Utc::now()
            + chrono::Duration::from_std(self.duration)
                .map_err(|e| StateError::Failed(format!("wait duration out of range: {}", e)))?;

        let data = WaitStateData {
            correlation_id: correlation_id.clone(),
            wakeup_at,
            duration_ms: self.duration.as_millis() as u64,
        };

        info!(
            "Wait '{}' sleeping {:?} until {}",
            ctx.instance().state_name,
            self.duration,
            wakeup_at.to_rfc3339()
        );
        arm(ctx.scheduler(), ctx.notify_engine(), correlation_id.clone(), self.duration);

        Ok(ExecutionResponse::wait_on(vec![correlation_id])
            .with_execution_data(serde_json::to_value(&data)?)
            .into())
    }

    fn recover(&self, ctx: &ExecutionContext<'_>) -> Result<(), StateError> {
        let data: WaitStateData = ctx.state_data()?;
        let remaining = (data.wakeup_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!("Re-arming timer '{}' in {:?}", data.correlation_id, remaining);
        arm(ctx.scheduler(), ctx.notify_engine(), data.correlation_id, remaining);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStack;
    use crate::execution::{ExecutionInstance, ExecutionStatus};
    use crate::states::harness::Harness;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_timer_notifies_once_when_due() {
        let harness = Harness::new();
        let mut instance = ExecutionInstance::root("wf", "pause_a_bit", ContextStack::new());
        instance.transition(ExecutionStatus::Running).unwrap();

        let wait = WaitState::new(Duration::from_secs(30));
        let response = wait.execute(&harness.ctx(&instance)).unwrap();
        assert!(response.validate().is_ok());
        let ids = response.response().correlation_ids.clone();
        assert_eq!(ids.len(), 1);

        let delivered: Arc<Mutex<Vec<HashMap<String, NotifyResult>>>> = Arc::default();
        let sink = Arc::clone(&delivered);
        harness
            .notify
            .register_wait(&instance.id, &ids, Box::new(move |_, results| sink.lock().unwrap().push(results)))
            .unwrap();

        assert_eq!(harness.clock.advance(Duration::from_secs(29)), 0);
        assert!(delivered.lock().unwrap().is_empty());

        assert_eq!(harness.clock.advance(Duration::from_secs(1)), 1);
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][&ids[0]].status, ExecutionStatus::Success);

        instance.state_data = response.response().execution_data.clone().unwrap();
        let resumed = wait.resume(&harness.ctx(&instance), &delivered[0]).unwrap();
        assert_eq!(resumed.response().status, ExecutionStatus::Success);
    }

    #[test]
    fn test_execution_data_records_wakeup() {
        let harness = Harness::new();
        let instance = ExecutionInstance::root("wf", "w", ContextStack::new());
        let response = WaitState::new(Duration::from_millis(1500))
            .execute(&harness.ctx(&instance))
            .unwrap();

        let data: WaitStateData =
            serde_json::from_value(response.response().execution_data.clone().unwrap()).unwrap();
        assert_eq!(data.duration_ms, 1500);
        assert_eq!(data.correlation_id, response.response().correlation_ids[0]);
        assert!(data.wakeup_at > Utc::now());
    }

    #[test]
    fn test_recover_rearms_timer() {
        let harness = Harness::new();
        let mut instance = ExecutionInstance::root("wf", "w", ContextStack::new());
        let wait = WaitState::new(Duration::from_secs(5));
        let response = wait.execute(&harness.ctx(&instance)).unwrap();
        instance.state_data = response.response().execution_data.clone().unwrap();

        wait.recover(&harness.ctx(&instance)).unwrap();
        assert_eq!(harness.clock.pending(), 2);
    }
}
