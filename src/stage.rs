//! Delivery progress: an append-only log of stage events per accepted request
use super::listing::TimeStamp;
use super::request::RequestStatus;
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    #[n(0)]
    Retrieved,
    #[n(1)]
    InProgress,
    #[n(2)]
    Completed,
}

impl Stage {
    pub const SEQUENCE: [Stage; 3] = [Stage::Retrieved, Stage::InProgress, Stage::Completed];

    pub fn ordinal(&self) -> usize {
        match self {
            Stage::Retrieved => 0,
            Stage::InProgress => 1,
            Stage::Completed => 2,
        }
    }

    /// Request status recorded alongside the event.
    pub fn derived_status(&self) -> RequestStatus {
        match self {
            Stage::Completed => RequestStatus::Delivered,
            _ => RequestStatus::Accepted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieved => "retrieved",
            Stage::InProgress => "in_progress",
            Stage::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub stage: Stage,
    #[n(2)]
    pub status: RequestStatus,
    #[n(3)]
    pub recorded_at: TimeStamp<Utc>,
}

impl StageEvent {
    pub fn new(request_id: &str, stage: Stage) -> Self {
        Self {
            request_id: request_id.to_string(),
            stage,
            status: stage.derived_status(),
            recorded_at: TimeStamp::new(),
        }
    }

    pub fn store_key(&self) -> String {
        stage_key(&self.request_id, self.stage.ordinal())
    }
}

pub(crate) fn stage_key(request_id: &str, index: usize) -> String {
    format!("{request_id}/{index}")
}

/// Progress derived from a request's stage log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageProgress {
    events: Vec<StageEvent>,
}

impl StageProgress {
    /// Builds progress from stored events, refusing logs that skip or repeat a stage.
    pub fn from_events(events: Vec<StageEvent>) -> Result<Self, String> {
        let mut progress = Self::default();
        for event in events {
            progress.push(event)?;
        }
        Ok(progress)
    }

    pub(crate) fn push(&mut self, event: StageEvent) -> Result<(), String> {
        match self.next_expected() {
            Some(expected) if expected == event.stage => {
                self.events.push(event);
                Ok(())
            }
            Some(expected) => Err(format!(
                "stage log out of sequence: expected {expected}, found {}",
                event.stage
            )),
            None => Err(format!("stage log already complete, found {}", event.stage)),
        }
    }

    /// Number of stages recorded so far, `0..=3`.
    pub fn current_index(&self) -> usize {
        self.events.len()
    }

    pub fn next_expected(&self) -> Option<Stage> {
        Stage::SEQUENCE.get(self.events.len()).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.next_expected().is_none()
    }

    pub fn last(&self) -> Option<&StageEvent> {
        self.events.last()
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events
    }

    pub fn delivered_at(&self) -> Option<&TimeStamp<Utc>> {
        self.events
            .iter()
            .find(|event| event.stage == Stage::Completed)
            .map(|event| &event.recorded_at)
    }
}
