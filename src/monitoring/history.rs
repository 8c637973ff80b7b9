//! Process History
//!
//! Audit trail of a process instance: one entry per visited flow object
//! with begin/end timestamps. Entries of call activities and sub-processes
//! carry the history of the nested instance as `subhistory`, so the tree
//! mirrors the process nesting.
//!
//! The history can be rendered as an ASCII timeline for reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const END_EVENT_TYPE: &str = "endEvent";

/// Width of the timeline bars in characters.
const TIMELINE_WIDTH: f64 = 50.0;

/// One visit of a flow object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub flow_object_type: String,

    pub begin: DateTime<Utc>,

    /// `None` until the flow object has completed.
    pub end: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subhistory: Option<History>,
}

impl HistoryEntry {
    pub fn new(name: impl Into<String>, flow_object_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flow_object_type: flow_object_type.into(),
            begin: Utc::now(),
            end: None,
            subhistory: None,
        }
    }

    pub fn is_end_event(&self) -> bool {
        self.flow_object_type == END_EVENT_TYPE
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end.map(|end| (end - self.begin).num_milliseconds())
    }
}

/// Ordered audit trail of one process instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct History {
    #[serde(default)]
    pub history_entries: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl History {
    /// Creates an empty history starting now.
    pub fn new() -> Self {
        Self {
            history_entries: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Records the begin of a visit.
    pub fn add_entry(&mut self, name: &str, flow_object_type: &str) -> &mut HistoryEntry {
        self.history_entries
            .push(HistoryEntry::new(name, flow_object_type));
        let last = self.history_entries.len() - 1;
        &mut self.history_entries[last]
    }

    /// Stamps `end` on the most recent entry named `name`.
    ///
    /// If that entry is the last one and belongs to an end event, the
    /// history itself is finished as well. Returns false if no entry exists.
    pub fn set_end(&mut self, name: &str) -> bool {
        let Some(index) = self.history_entries.iter().rposition(|e| e.name == name) else {
            return false;
        };

        let now = Utc::now();
        self.history_entries[index].end = Some(now);

        if index + 1 == self.history_entries.len() && self.history_entries[index].is_end_event() {
            self.finished_at = Some(now);
        }
        true
    }

    /// Stamps `end` on every open entry named `name`. Returns the number of
    /// entries ended.
    pub fn set_end_all(&mut self, name: &str) -> usize {
        let now = Utc::now();
        let mut ended = 0;
        for entry in self
            .history_entries
            .iter_mut()
            .filter(|e| e.name == name && e.end.is_none())
        {
            entry.end = Some(now);
            ended += 1;
        }
        ended
    }

    /// True if `name` was entered here or in any nested history.
    pub fn has_been_visited(&self, name: &str) -> bool {
        self.history_entries.iter().any(|entry| {
            entry.name == name
                || entry
                    .subhistory
                    .as_ref()
                    .map(|sub| sub.has_been_visited(name))
                    .unwrap_or(false)
        })
    }

    pub fn last_entry(&self, name: &str) -> Option<&HistoryEntry> {
        self.history_entries.iter().rev().find(|e| e.name == name)
    }

    pub fn last_entry_mut(&mut self, name: &str) -> Option<&mut HistoryEntry> {
        self.history_entries.iter_mut().rev().find(|e| e.name == name)
    }

    pub fn first_entry_of_type(&self, flow_object_type: &str) -> Option<&HistoryEntry> {
        self.history_entries
            .iter()
            .find(|e| e.flow_object_type == flow_object_type)
    }

    pub fn last_entry_of_type(&self, flow_object_type: &str) -> Option<&HistoryEntry> {
        self.history_entries
            .iter()
            .rev()
            .find(|e| e.flow_object_type == flow_object_type)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Milliseconds between creation and finish.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.created_at).num_milliseconds())
    }

    /// Names of the visited flow objects, top level only.
    pub fn entry_names(&self) -> Vec<&str> {
        self.history_entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Renders an ASCII timeline with one bar per visit.
    ///
    /// Unfinished visits are drawn up to the latest known timestamp and
    /// marked with `>`. Nested histories are indented below their entry.
    pub fn render_timeline(&self) -> String {
        let mut output = String::from("\nProcess Timeline:\n\n");

        let horizon = self.latest_timestamp();
        let total_ms = (horizon - self.created_at).num_milliseconds().max(1);
        let scale = TIMELINE_WIDTH / total_ms as f64;

        self.render_entries(&mut output, self.created_at, horizon, scale, 0);

        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }

    fn render_entries(
        &self,
        output: &mut String,
        origin: DateTime<Utc>,
        horizon: DateTime<Utc>,
        scale: f64,
        depth: usize,
    ) {
        for entry in &self.history_entries {
            let start = (entry.begin - origin).num_milliseconds().max(0);
            let end = (entry.end.unwrap_or(horizon) - origin)
                .num_milliseconds()
                .max(start);

            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));
            if entry.end.is_none() {
                bar.push('>');
            }

            let label = format!("{}{}", "  ".repeat(depth), entry.name);
            output.push_str(&format!(
                "{} |{:<width$}| ({} ms)\n",
                truncate(&label, 20),
                bar,
                end - start,
                width = TIMELINE_WIDTH as usize + 1
            ));

            if let Some(subhistory) = &entry.subhistory {
                subhistory.render_entries(output, origin, horizon, scale, depth + 1);
            }
        }
    }

    fn latest_timestamp(&self) -> DateTime<Utc> {
        let mut latest = self.finished_at.unwrap_or(self.created_at);
        for entry in &self.history_entries {
            latest = latest.max(entry.end.unwrap_or(entry.begin));
            if let Some(subhistory) = &entry.subhistory {
                latest = latest.max(subhistory.latest_timestamp());
            }
        }
        latest
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_creation() {
        let history = History::new();
        assert!(history.history_entries.is_empty());
        assert!(!history.is_finished());
    }

    #[test]
    fn test_set_end_uses_most_recent_entry() {
        let mut history = History::new();
        history.add_entry("Loop", "task");
        history.add_entry("Loop", "task");

        assert!(history.set_end("Loop"));
        assert!(history.history_entries[0].end.is_none());
        assert!(history.history_entries[1].end.is_some());
        assert!(!history.set_end("Missing"));
    }

    #[test]
    fn test_set_end_all_closes_open_entries() {
        let mut history = History::new();
        history.add_entry("Join", "parallelGateway");
        history.add_entry("Task", "task");
        history.add_entry("Join", "parallelGateway");

        assert_eq!(history.set_end_all("Join"), 2);
        assert!(history.history_entries[0].end.is_some());
        assert!(history.history_entries[1].end.is_none());
        assert!(history.history_entries[2].end.is_some());
        assert_eq!(history.set_end_all("Join"), 0);
    }

    #[test]
    fn test_end_event_finishes_history() {
        let mut history = History::new();
        history.add_entry("Start", "startEvent");
        history.set_end("Start");
        assert!(!history.is_finished());

        history.add_entry("End", "endEvent");
        history.set_end("End");
        assert!(history.is_finished());
        assert!(history.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_has_been_visited_recurses() {
        let mut nested = History::new();
        nested.add_entry("Inner", "task");

        let mut history = History::new();
        history.add_entry("Call", "callActivity").subhistory = Some(nested);

        assert!(history.has_been_visited("Call"));
        assert!(history.has_been_visited("Inner"));
        assert!(!history.has_been_visited("Other"));
    }

    #[test]
    fn test_entry_lookup_by_type() {
        let mut history = History::new();
        history.add_entry("Start", "startEvent");
        history.add_entry("First End", "endEvent");
        history.add_entry("Second End", "endEvent");

        assert_eq!(history.first_entry_of_type("startEvent").unwrap().name, "Start");
        assert_eq!(history.last_entry_of_type("endEvent").unwrap().name, "Second End");
        assert_eq!(history.entry_names(), vec!["Start", "First End", "Second End"]);
    }

    #[test]
    fn test_serialization_shape() {
        let mut history = History::new();
        history.add_entry("Start", "startEvent");

        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["historyEntries"][0]["type"], "startEvent");
        assert!(json["historyEntries"][0]["end"].is_null());
        assert!(json.get("createdAt").is_some());
        assert!(json["finishedAt"].is_null());
    }

    #[test]
    fn test_render_timeline() {
        let mut nested = History::new();
        nested.add_entry("Inner Task", "task");

        let mut history = History::new();
        history.add_entry("Start", "startEvent");
        history.set_end("Start");
        history.add_entry("Call", "callActivity").subhistory = Some(nested);

        let chart = history.render_timeline();
        assert!(chart.contains("Process Timeline"));
        assert!(chart.contains("Start"));
        assert!(chart.contains("  Inner Task"));
        assert!(chart.contains('>'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate_long_labels() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a very long flow object name", 10), "a very ...");
    }
}
