//! Persistence format of the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// A single state transition of a workflow run.
///
/// Serialised adjacently tagged, which gives the `event_type` / `payload`
/// split used by the SQL backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum RunEvent {
    /// First event of every run.
    RunCreated {
        workflow_name: String,
        input: Value,
        /// Step names in registration order.
        steps: Vec<String>,
    },
    StepReady {
        step: String,
        attempt: u32,
    },
    StepStarted {
        step: String,
        attempt: u32,
    },
    StepSucceeded {
        step: String,
        attempt: u32,
        output: Value,
    },
    /// `retry_in_ms` is set when another attempt has been scheduled.
    StepFailed {
        step: String,
        attempt: u32,
        error: String,
        retry_in_ms: Option<u64>,
    },
    RunSucceeded,
    RunFailed {
        step: String,
        attempt: u32,
        error: String,
    },
    RunCancelled,
}

impl RunEvent {
    /// Value of the `event_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::StepReady { .. } => "step_ready",
            Self::StepStarted { .. } => "step_started",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::RunSucceeded => "run_succeeded",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled => "run_cancelled",
        }
    }

    /// Terminal events end a run's log.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunSucceeded | Self::RunFailed { .. } | Self::RunCancelled)
    }

    /// The step this event is about, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepReady { step, .. }
            | Self::StepStarted { step, .. }
            | Self::StepSucceeded { step, .. }
            | Self::StepFailed { step, .. }
            | Self::RunFailed { step, .. } => Some(step),
            Self::RunCreated { .. } | Self::RunSucceeded | Self::RunCancelled => None,
        }
    }

    /// Split into the `event_type` and `payload` columns.
    pub fn to_columns(&self) -> Result<(&'static str, String), serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        let payload = tagged
            .as_object_mut()
            .and_then(|obj| obj.remove("payload"))
            .unwrap_or(Value::Null);
        Ok((self.kind(), serde_json::to_string(&payload)?))
    }

    /// Inverse of [`RunEvent::to_columns`].
    pub fn from_columns(event_type: &str, payload: &str) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_str(payload)?;
        let mut tagged = serde_json::Map::new();
        tagged.insert("event_type".into(), Value::String(event_type.to_owned()));
        if !payload.is_null() {
            tagged.insert("payload".into(), payload);
        }
        serde_json::from_value(Value::Object(tagged))
    }
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// One row of the log: `{run_id, sequence, event_type, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: Uuid,
    /// 1-based, strictly increasing per run.
    pub sequence: u64,
    pub event: RunEvent,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(run_id: Uuid, sequence: u64, event: RunEvent) -> Self {
        Self {
            run_id,
            sequence,
            event,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn columns_split_tag_from_payload() {
        let event = RunEvent::StepFailed {
            step: "charge".into(),
            attempt: 2,
            error: "card declined".into(),
            retry_in_ms: Some(200),
        };
        let (kind, payload) = event.to_columns().unwrap();
        assert_eq!(kind, "step_failed");
        let payload: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            payload,
            json!({ "step": "charge", "attempt": 2, "error": "card declined", "retry_in_ms": 200 })
        );
        assert_eq!(RunEvent::from_columns(kind, &serde_json::to_string(&payload).unwrap()).unwrap(), event);
    }

    #[test]
    fn unit_events_have_null_payload() {
        let (kind, payload) = RunEvent::RunCancelled.to_columns().unwrap();
        assert_eq!(kind, "run_cancelled");
        assert_eq!(payload, "null");
        assert_eq!(RunEvent::from_columns(kind, &payload).unwrap(), RunEvent::RunCancelled);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(RunEvent::from_columns("step_exploded", "{}").is_err());
    }

    #[test]
    fn only_run_outcomes_are_terminal() {
        assert!(RunEvent::RunSucceeded.is_terminal());
        assert!(RunEvent::RunCancelled.is_terminal());
        assert!(RunEvent::RunFailed { step: "a".into(), attempt: 1, error: "x".into() }.is_terminal());
        assert!(!RunEvent::StepReady { step: "a".into(), attempt: 1 }.is_terminal());
    }
}
