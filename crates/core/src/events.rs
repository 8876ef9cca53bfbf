use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event recorded during a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Value a step resolved to at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResolvedValue {
    Command(String),
    Choice(String),
    Prompt(String),
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_name: Option<String>,
        step_count: usize,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },

    // Step lifecycle events
    StepSkipped {
        step_index: usize,
        branch_index: Option<usize>,
    },
    StepCompleted {
        step_index: usize,
        branch_index: Option<usize>,
        kind: String,
        resolved: Option<ResolvedValue>,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    StepFailed {
        step_index: usize,
        branch_index: Option<usize>,
        kind: String,
        resolved: Option<ResolvedValue>,
        exit_code: Option<i32>,
        error: String,
        duration_ms: u64,
    },
    StepRetried {
        step_index: usize,
        branch_index: Option<usize>,
        attempt: u32,
        delay_ms: u64,
    },
    FallbackStarted {
        step_index: usize,
        branch_index: Option<usize>,
        level: usize,
        command: String,
    },

    // Parallel fan-out events
    ParallelStarted {
        step_index: usize,
        branches: usize,
    },
    ParallelFinished {
        step_index: usize,
        success: bool,
    },
}

impl EventType {
    /// Whether this event closes out a step, successfully or not
    pub fn is_step_result(&self) -> bool {
        matches!(
            self,
            EventType::StepCompleted { .. } | EventType::StepFailed { .. }
        )
    }
}

/// Ordered events of one run plus the instant it started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub run_id: RunId,
    pub workflow_name: Option<String>,
    pub initial_timestamp: DateTime<Utc>,
    pub events: Vec<Event>,
}

impl History {
    pub fn new(run_id: RunId, workflow_name: Option<String>) -> Self {
        Self {
            run_id,
            workflow_name,
            initial_timestamp: Utc::now(),
            events: Vec::new(),
        }
    }

    /// Events that record a finished step, in completion order
    pub fn step_results(&self) -> impl Iterator<Item = &Event> {
        self.events
            .iter()
            .filter(|event| event.event_type.is_step_result())
    }

    /// Milliseconds between the start of the run and the last event
    pub fn elapsed_ms(&self) -> u64 {
        self.events
            .last()
            .map(|event| {
                (event.timestamp - self.initial_timestamp)
                    .num_milliseconds()
                    .max(0) as u64
            })
            .unwrap_or(0)
    }
}
