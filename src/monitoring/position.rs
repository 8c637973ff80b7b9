//! Position Reporting
//!
//! Hook for external debuggers that follow a running process. The engine
//! notifies the listener whenever a token enters or leaves a flow object.
//! Listener failures are logged and never affect execution.

use std::error::Error;

use log::info;

pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Receives flow-object entry and exit notifications.
pub trait PositionListener: Send {
    fn flow_object_entered(&mut self, process_id: &str, flow_object_name: &str) -> ListenerResult;

    fn flow_object_left(&mut self, process_id: &str, flow_object_name: &str) -> ListenerResult;
}

/// Writes every position change to the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingPositionListener {
    notifications: usize,
}

impl LoggingPositionListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications received so far.
    pub fn notifications(&self) -> usize {
        self.notifications
    }
}

impl PositionListener for LoggingPositionListener {
    fn flow_object_entered(&mut self, process_id: &str, flow_object_name: &str) -> ListenerResult {
        self.notifications += 1;
        info!("[{}] -> {}", process_id, flow_object_name);
        Ok(())
    }

    fn flow_object_left(&mut self, process_id: &str, flow_object_name: &str) -> ListenerResult {
        self.notifications += 1;
        info!("[{}] <- {}", process_id, flow_object_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_listener_counts_notifications() {
        let mut listener = LoggingPositionListener::new();
        listener.flow_object_entered("p", "Start").unwrap();
        listener.flow_object_left("p", "Start").unwrap();
        assert_eq!(listener.notifications(), 2);
    }
}
