//! Pending Timer Events
//!
//! Boundary timer events and intermediate timer catch events are scheduled
//! on the tokio runtime. A fired timer is not handled on the timer task;
//! it is sent back to the engine over a channel and dispatched on the next
//! [`ProcessEngine::process_timer_events`](crate::ProcessEngine::process_timer_events)
//! call, so process logic stays single threaded.
//!
//! Every scheduled entry carries a generation number. Removing or
//! rescheduling an entry bumps the generation, which makes a late
//! notification from an aborted task recognizably stale.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::definition::ProcessDefinition;
use crate::error::EngineError;

/// Which catch signal a timer raises when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Boundary,
    Intermediate,
}

/// Notification sent to the engine when a timer expires.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerFired {
    pub process_id: String,
    pub name: String,
    pub kind: TimerKind,
    pub generation: u64,
}

/// Persisted form of a pending timeout.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PersistedTimeout {
    pub timeout: u64,
}

#[derive(Debug)]
struct PendingTimeout {
    timeout: u64,
    kind: TimerKind,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Validates the value returned by a `$getTimeout` handler.
///
/// Only finite, non-negative numbers are accepted; fractional values are
/// truncated to whole milliseconds.
pub fn parse_timeout(handler: &str, value: &Value) -> Result<u64, EngineError> {
    let invalid = || EngineError::InvalidTimeout {
        handler: handler.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Number(number) => {
            if let Some(ms) = number.as_u64() {
                return Ok(ms);
            }
            match number.as_f64() {
                Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms as u64),
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

/// Timers owned by one process instance.
#[derive(Debug)]
pub struct PendingTimerEvents {
    process_id: String,
    sender: UnboundedSender<TimerFired>,
    timeouts: BTreeMap<String, PendingTimeout>,
    next_generation: u64,
}

impl PendingTimerEvents {
    pub fn new(process_id: impl Into<String>, sender: UnboundedSender<TimerFired>) -> Self {
        Self {
            process_id: process_id.into(),
            sender,
            timeouts: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Schedules the timer of a boundary event.
    pub fn add_boundary_timer_event(&mut self, name: &str, timeout: u64) -> Result<(), EngineError> {
        self.schedule(name, timeout, TimerKind::Boundary)
    }

    /// Schedules the timer of an intermediate catch event.
    pub fn add_intermediate_timer_event(
        &mut self,
        name: &str,
        timeout: u64,
    ) -> Result<(), EngineError> {
        self.schedule(name, timeout, TimerKind::Intermediate)
    }

    /// Cancels and discards a timer. Returns false if none was pending.
    pub fn remove_timeout(&mut self, name: &str) -> bool {
        match self.timeouts.remove(name) {
            Some(pending) => {
                if let Some(handle) = pending.handle {
                    handle.abort();
                }
                debug!("[{}] Timer '{}' removed", self.process_id, name);
                true
            }
            None => false,
        }
    }

    /// Re-creates timers from a persisted `{name: {timeout}}` map.
    ///
    /// The stored duration is trusted; timeout handlers are not asked again.
    /// Entries whose flow object no longer exists are dropped.
    pub fn restore_timer_events(
        &mut self,
        persisted: &BTreeMap<String, PersistedTimeout>,
        definition: &ProcessDefinition,
    ) -> Vec<EngineError> {
        let mut errors = Vec::new();

        for (name, entry) in persisted {
            let kind = match definition.get_flow_object_by_name(name) {
                Some(fo) if fo.is_boundary_event() => TimerKind::Boundary,
                Some(fo) if fo.is_intermediate_catch_event() => TimerKind::Intermediate,
                _ => {
                    warn!(
                        "[{}] Dropping persisted timer '{}': no matching timer event",
                        self.process_id, name
                    );
                    continue;
                }
            };

            if let Err(e) = self.schedule(name, entry.timeout, kind) {
                errors.push(e);
            }
        }
        errors
    }

    pub fn has_timeouts(&self) -> bool {
        !self.timeouts.is_empty()
    }

    /// True if at least one timer is actually running on a runtime.
    pub fn has_scheduled_timeouts(&self) -> bool {
        self.timeouts.values().any(|t| t.handle.is_some())
    }

    pub fn get_timeout(&self, name: &str) -> Option<u64> {
        self.timeouts.get(name).map(|t| t.timeout)
    }

    /// Names of the pending timers.
    pub fn names(&self) -> Vec<String> {
        self.timeouts.keys().cloned().collect()
    }

    /// Snapshot in persisted form.
    pub fn pending_timeouts(&self) -> BTreeMap<String, PersistedTimeout> {
        self.timeouts
            .iter()
            .map(|(name, t)| (name.clone(), PersistedTimeout { timeout: t.timeout }))
            .collect()
    }

    /// Consumes a fired notification.
    ///
    /// Returns true and discards the entry if the notification belongs to
    /// the currently scheduled timer; stale notifications return false.
    pub fn take_fired(&mut self, fired: &TimerFired) -> bool {
        let current = self
            .timeouts
            .get(&fired.name)
            .map(|t| t.generation == fired.generation && t.kind == fired.kind)
            .unwrap_or(false);

        if current {
            self.timeouts.remove(&fired.name);
        }
        current
    }

    /// Cancels every pending timer.
    pub fn clear(&mut self) {
        for (_, pending) in std::mem::take(&mut self.timeouts) {
            if let Some(handle) = pending.handle {
                handle.abort();
            }
        }
    }

    fn schedule(&mut self, name: &str, timeout: u64, kind: TimerKind) -> Result<(), EngineError> {
        self.remove_timeout(name);

        self.next_generation += 1;
        let generation = self.next_generation;

        let fired = TimerFired {
            process_id: self.process_id.clone(),
            name: name.to_string(),
            kind,
            generation,
        };

        let spawned = tokio::runtime::Handle::try_current().map(|runtime| {
            let sender = self.sender.clone();
            runtime.spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout)).await;
                // The engine may already be gone.
                let _ = sender.send(fired);
            })
        });

        let (handle, result) = match spawned {
            Ok(handle) => (Some(handle), Ok(())),
            Err(e) => (
                None,
                Err(EngineError::TimerUnavailable {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            ),
        };

        debug!(
            "[{}] Timer '{}' set to {} ms ({:?})",
            self.process_id, name, timeout, kind
        );

        // Unscheduled timers are still recorded so they persist and can be
        // restored on a runtime later.
        self.timeouts.insert(
            name.to_string(),
            PendingTimeout {
                timeout,
                kind,
                generation,
                handle,
            },
        );
        result
    }
}

impl Drop for PendingTimerEvents {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EventDefinition, FlowObject, TaskType};
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_parse_timeout_accepts_non_negative_numbers() {
        assert_eq!(parse_timeout("h", &json!(250)).unwrap(), 250);
        assert_eq!(parse_timeout("h", &json!(1.9)).unwrap(), 1);
        assert_eq!(parse_timeout("h", &json!(0)).unwrap(), 0);
    }

    #[test]
    fn test_parse_timeout_rejects_other_values() {
        for value in [json!(-1), json!("100"), json!(null), json!({"ms": 5})] {
            let err = parse_timeout("Wait$getTimeout", &value).unwrap_err();
            assert!(matches!(err, EngineError::InvalidTimeout { .. }));
            assert!(err.to_string().contains("Wait$getTimeout"));
        }
    }

    #[test]
    fn test_schedule_without_runtime_is_reported_but_recorded() {
        let (tx, _rx) = unbounded_channel();
        let mut timers = PendingTimerEvents::new("p", tx);

        let result = timers.add_intermediate_timer_event("Wait", 10);
        assert!(matches!(result, Err(EngineError::TimerUnavailable { .. })));
        assert_eq!(timers.get_timeout("Wait"), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_through_channel() {
        let (tx, mut rx) = unbounded_channel();
        let mut timers = PendingTimerEvents::new("p", tx);
        timers.add_boundary_timer_event("Timeout", 1000).unwrap();
        assert!(timers.has_timeouts());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.name, "Timeout");
        assert_eq!(fired.kind, TimerKind::Boundary);
        assert!(timers.take_fired(&fired));
        assert!(!timers.has_timeouts());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_timer_never_fires() {
        let (tx, mut rx) = unbounded_channel();
        let mut timers = PendingTimerEvents::new("p", tx);
        timers.add_boundary_timer_event("Timeout", 100).unwrap();
        assert!(timers.remove_timeout("Timeout"));
        assert!(!timers.remove_timeout("Timeout"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduled_timer_makes_old_notification_stale() {
        let (tx, _rx) = unbounded_channel();
        let mut timers = PendingTimerEvents::new("p", tx);
        timers.add_intermediate_timer_event("Wait", 100).unwrap();

        let stale = TimerFired {
            process_id: "p".to_string(),
            name: "Wait".to_string(),
            kind: TimerKind::Intermediate,
            generation: 1,
        };
        timers.add_intermediate_timer_event("Wait", 200).unwrap();

        assert!(!timers.take_fired(&stale));
        assert_eq!(timers.get_timeout("Wait"), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_uses_flow_object_kind() {
        let mut def = ProcessDefinition::new("p", "P");
        def.add_flow_object(FlowObject::task("t", "Review", TaskType::UserTask));
        def.add_flow_object(FlowObject::boundary_event(
            "b",
            "Too Late",
            "t",
            EventDefinition::Timer,
        ));

        let mut persisted = BTreeMap::new();
        persisted.insert("Too Late".to_string(), PersistedTimeout { timeout: 50 });
        persisted.insert("Gone".to_string(), PersistedTimeout { timeout: 50 });

        let (tx, mut rx) = unbounded_channel();
        let mut timers = PendingTimerEvents::new("p", tx);
        let errors = timers.restore_timer_events(&persisted, &def);

        assert!(errors.is_empty());
        assert_eq!(timers.names(), vec!["Too Late".to_string()]);
        assert_eq!(timers.pending_timeouts()["Too Late"].timeout, 50);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Boundary);
    }
}
