//! Execution Timeline
//!
//! Tracks step start/end times for run reports and an ASCII Gantt chart.

use std::collections::HashMap;
use std::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step was skipped by its error strategy
    Skipped,
    /// Mutation simulated in dry run
    Simulated,
    /// Inverse operation invoked during rollback
    RolledBack,
}

impl EventType {
    fn ends_step(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Simulated)
    }

    fn marker(&self) -> char {
        match self {
            Self::Failed => 'x',
            Self::Skipped => '-',
            Self::Simulated => '~',
            _ => '#',
        }
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Records when each step starts and ends during one run.
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
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Step ids with a given event, in recording order.
    pub fn steps_with(&self, event_type: EventType) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.step_id.as_str())
            .collect()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Bars use `#` for success, `x` for failure, `-` for skipped and `~`
    /// for simulated steps.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        let scale = 50.0 / total_time as f64;
        let mut step_times: HashMap<&str, (u128, u128, EventType)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type == EventType::Started {
                step_times.insert(&event.step_id, (elapsed, elapsed, EventType::Started));
            } else if event.event_type.ends_step() {
                if let Some(times) = step_times.get_mut(event.step_id.as_str()) {
                    times.1 = elapsed;
                    times.2 = event.event_type;
                }
            }
        }

        let mut sorted_steps: Vec<_> = step_times.into_iter().collect();
        sorted_steps.sort_by_key(|(id, (start, _, _))| (*start, id.to_string()));

        for (step_id, (start, end, outcome)) in sorted_steps {
            if outcome == EventType::Started {
                continue;
            }
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&outcome.marker().to_string().repeat(width));

            output.push_str(&format!(
                "{:12} |{}| ({} ms)\n",
                truncate(step_id, 12),
                bar,
                end - start
            ));
        }

        let rolled_back = self.steps_with(EventType::RolledBack);
        if !rolled_back.is_empty() {
            output.push_str(&format!("\nRolled back: {}\n", rolled_back.join(", ")));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.step_id, event.timestamp);
                }
                kind if kind.ends_step() => {
                    if let Some(start) = starts.get(event.step_id.as_str()) {
                        durations.insert(
                            event.step_id.clone(),
                            event.timestamp.duration_since(*start).as_millis(),
                        );
                    }
                }
                _ => {}
            }
        }

        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
