//! Execution Timeline
//!
//! Tracks instance lifecycle events for timing reports.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// State started executing
    Started,
    /// State suspended on a wait-set
    Suspended,
    /// Wait-set completed and the state resumed
    Resumed,
    /// Finished with SUCCESS
    Completed,
    /// Finished with FAILED or ERROR
    Failed,
    Aborted,
    Paused,
}

impl EventType {
    fn is_end(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub instance_id: String,
    pub state_name: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the lifecycle of every instance an engine ran.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for an instance.
    pub fn add_event(&mut self, instance_id: impl Into<String>, state_name: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            instance_id: instance_id.into(),
            state_name: state_name.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Events of one instance, in order.
    pub fn events_for(&self, instance_id: &str) -> Vec<&TimelineEvent> {
        self.events.iter().filter(|e| e.instance_id == instance_id).collect()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Elapsed time from first start to end, per finished instance.
    pub fn durations(&self) -> HashMap<String, Duration> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.entry(event.instance_id.as_str()).or_insert(event.timestamp);
                }
                end if end.is_end() => {
                    if let Some(start) = starts.get(event.instance_id.as_str()) {
                        durations.insert(event.instance_id.clone(), event.timestamp.duration_since(*start));
                    }
                }
                _ => {}
            }
        }

        durations
    }

    /// Per-state report: runs, outcomes and total time spent.
    pub fn summary(&self) -> String {
        #[derive(Default)]
        struct Row {
            started: usize,
            completed: usize,
            failed: usize,
            aborted: usize,
            suspended: usize,
            total: Duration,
        }

        let durations = self.durations();
        let mut rows: HashMap<&str, Row> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();

        for event in &self.events {
            let name = event.state_name.as_str();
            if !rows.contains_key(name) {
                order.push(name);
            }
            let row = rows.entry(name).or_default();
            match event.event_type {
                EventType::Started => row.started += 1,
                EventType::Suspended => row.suspended += 1,
                EventType::Completed => row.completed += 1,
                EventType::Failed => row.failed += 1,
                EventType::Aborted => row.aborted += 1,
                EventType::Resumed | EventType::Paused => {}
            }
            if event.event_type.is_end() {
                if let Some(d) = durations.get(&event.instance_id) {
                    row.total += *d;
                }
            }
        }

        let mut output = String::from("\nExecution Summary:\n\n");
        output.push_str(&format!(
            "{:16} {:>5} {:>5} {:>5} {:>5} {:>7} {:>10}\n",
            "state", "runs", "ok", "fail", "abort", "waits", "time"
        ));
        for name in order {
            if let Some(row) = rows.get(name) {
                output.push_str(&format!(
                    "{:16} {:>5} {:>5} {:>5} {:>5} {:>7} {:>7} ms\n",
                    truncate(name, 16),
                    row.started,
                    row.completed,
                    row.failed,
                    row.aborted,
                    row.suspended,
                    row.total.as_millis()
                ));
            }
        }
        output.push_str(&format!("\nTotal: {} ms\n", self.elapsed().as_millis()));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
