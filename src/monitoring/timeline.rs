//! Execution Timeline
//!
//! Records when each step is dispatched and how it ends, for run
//! reports, dispatch-order inspection and Gantt charts.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::workflow::model::StepId;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step handed to a worker
    Dispatched,
    /// Step finished and its artifacts were verified
    Completed,
    /// Step failed
    Failed,
    /// Step was skipped without running
    Skipped,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step: StepId,
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of one run.
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

    /// Records an event for a step.
    pub fn add_event(&mut self, step: StepId, label: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step,
            label: label.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Step ids in the order they were dispatched.
    pub fn dispatch_order(&self) -> Vec<StepId> {
        self.events
            .iter()
            .filter(|e| e.event_type == EventType::Dispatched)
            .map(|e| e.step)
            .collect()
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatch_order().len()
    }

    /// Highest number of steps running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        let mut running = 0usize;
        let mut peak = 0;
        for event in &self.events {
            match event.event_type {
                EventType::Dispatched => {
                    running += 1;
                    peak = peak.max(running);
                }
                EventType::Completed | EventType::Failed => {
                    running = running.saturating_sub(1);
                }
                EventType::Skipped => {}
            }
        }
        peak
    }

    /// Returns step durations from dispatch to finish.
    pub fn durations(&self) -> BTreeMap<StepId, Duration> {
        let mut starts: BTreeMap<StepId, Instant> = BTreeMap::new();
        let mut durations = BTreeMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Dispatched => {
                    starts.insert(event.step, event.timestamp);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(&event.step) {
                        durations.insert(event.step, event.timestamp.duration_since(*start));
                    }
                }
                EventType::Skipped => {}
            }
        }

        durations
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each dispatched step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut bars: Vec<(u128, u128, &str, bool)> = Vec::new();
        let mut starts: BTreeMap<StepId, (u128, &str)> = BTreeMap::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Dispatched => {
                    starts.insert(event.step, (at, event.label.as_str()));
                }
                EventType::Completed | EventType::Failed => {
                    if let Some((start, label)) = starts.remove(&event.step) {
                        bars.push((start, at, label, event.event_type == EventType::Failed));
                    }
                }
                EventType::Skipped => {}
            }
        }

        bars.sort_by_key(|(start, ..)| *start);

        for (start, end, label, failed) in bars {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&(if failed { "x" } else { "#" }).repeat(width));

            output.push_str(&format!(
                "{:12} |{:<50}| ({} ms)\n",
                truncate(label, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a label to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events().is_empty());
        assert_eq!(timeline.peak_concurrency(), 0);
    }

    #[test]
    fn test_dispatch_order() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(StepId(2), "b", EventType::Dispatched);
        timeline.add_event(StepId(1), "a", EventType::Dispatched);
        timeline.add_event(StepId(2), "b", EventType::Completed);
        timeline.add_event(StepId(3), "c", EventType::Skipped);

        assert_eq!(timeline.dispatch_order(), vec![StepId(2), StepId(1)]);
        assert_eq!(timeline.dispatched_count(), 2);
    }

    #[test]
    fn test_peak_concurrency() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(StepId(1), "a", EventType::Dispatched);
        timeline.add_event(StepId(2), "b", EventType::Dispatched);
        timeline.add_event(StepId(1), "a", EventType::Completed);
        timeline.add_event(StepId(3), "c", EventType::Dispatched);
        timeline.add_event(StepId(2), "b", EventType::Failed);
        timeline.add_event(StepId(3), "c", EventType::Completed);
        timeline.add_event(StepId(4), "d", EventType::Dispatched);

        assert_eq!(timeline.peak_concurrency(), 2);
    }

    #[test]
    fn test_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(StepId(1), "a", EventType::Dispatched);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event(StepId(1), "a", EventType::Completed);
        timeline.add_event(StepId(2), "b", EventType::Dispatched);

        let durations = timeline.durations();
        assert!(durations[&StepId(1)] >= Duration::from_millis(30));
        assert!(!durations.contains_key(&StepId(2)));
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(StepId(1), "copyImages", EventType::Dispatched);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event(StepId(1), "copyImages", EventType::Completed);
        timeline.add_event(StepId(2), "runFourierFilter", EventType::Dispatched);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event(StepId(2), "runFourierFilter", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("copyImages"));
        assert!(chart
            .lines()
            .any(|line| line.starts_with("runFourie...") && line.contains('x')));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 12), "short");
        assert_eq!(truncate("averyverylongname", 8), "avery...");
    }
}
