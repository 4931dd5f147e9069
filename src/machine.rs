//! Transition rules for a delivery request
//!
//! ```text
//! pending --accept--> accepted --advance(retrieved, in_progress)--> accepted
//!    |                    |
//!    +--refuse--> refused +--advance(completed)--> delivered
//! ```
//!
//! Everything here is pure: the service loads the current status and stage log,
//! asks [`transition`] for the next status, and only then writes.
use super::request::RequestStatus;
use super::stage::{Stage, StageProgress};
use super::thread::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Accept,
    Refuse,
    AdvanceStage(Stage),
    /// `free_text` is false for confirmations and attachments.
    SendMessage { free_text: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The request already left the state the command expects.
    Conflict(RequestStatus),
    /// Wrong role, wrong state or out of sequence.
    Invalid(String),
}

pub fn transition(
    status: RequestStatus,
    role: Role,
    command: Command,
    progress: &StageProgress,
) -> Result<RequestStatus, Rejection> {
    match command {
        Command::Accept | Command::Refuse => {
            if role != Role::Carrier {
                return Err(Rejection::Invalid(
                    "only the carrier can answer a delivery request".into(),
                ));
            }
            if status != RequestStatus::Pending {
                return Err(Rejection::Conflict(status));
            }
            Ok(match command {
                Command::Accept => RequestStatus::Accepted,
                _ => RequestStatus::Refused,
            })
        }
        Command::AdvanceStage(stage) => {
            if role != Role::Carrier {
                return Err(Rejection::Invalid(
                    "only the carrier can record delivery progress".into(),
                ));
            }
            if status != RequestStatus::Accepted {
                return Err(Rejection::Invalid(format!(
                    "delivery progress needs an accepted request, not {status}"
                )));
            }
            match progress.next_expected() {
                Some(expected) if expected == stage => Ok(stage.derived_status()),
                Some(expected) => Err(Rejection::Invalid(format!(
                    "expected stage {expected}, got {stage}"
                ))),
                None => Err(Rejection::Invalid("every stage is already recorded".into())),
            }
        }
        Command::SendMessage { free_text } => {
            if free_text && status != RequestStatus::Accepted {
                return Err(Rejection::Invalid(format!(
                    "messaging is closed while the request is {status}"
                )));
            }
            if !free_text && status == RequestStatus::Refused {
                return Err(Rejection::Invalid("the request was refused".into()));
            }
            Ok(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageEvent;

    fn progress(n: usize) -> StageProgress {
        StageProgress::from_events(
            Stage::SEQUENCE[..n]
                .iter()
                .map(|s| StageEvent::new("req_1", *s))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn carrier_accepts_pending() {
        let next = transition(
            RequestStatus::Pending,
            Role::Carrier,
            Command::Accept,
            &progress(0),
        );
        assert_eq!(next, Ok(RequestStatus::Accepted));
    }

    #[test]
    fn second_accept_is_a_conflict() {
        let next = transition(
            RequestStatus::Accepted,
            Role::Carrier,
            Command::Accept,
            &progress(0),
        );
        assert_eq!(next, Err(Rejection::Conflict(RequestStatus::Accepted)));
    }

    #[test]
    fn client_cannot_refuse() {
        let next = transition(
            RequestStatus::Pending,
            Role::Client,
            Command::Refuse,
            &progress(0),
        );
        assert!(matches!(next, Err(Rejection::Invalid(_))));
    }

    #[test]
    fn completed_stage_delivers() {
        let next = transition(
            RequestStatus::Accepted,
            Role::Carrier,
            Command::AdvanceStage(Stage::Completed),
            &progress(2),
        );
        assert_eq!(next, Ok(RequestStatus::Delivered));
    }

    #[test]
    fn skipping_ahead_is_invalid() {
        let next = transition(
            RequestStatus::Accepted,
            Role::Carrier,
            Command::AdvanceStage(Stage::Completed),
            &progress(0),
        );
        assert!(matches!(next, Err(Rejection::Invalid(_))));
    }

    #[test]
    fn free_text_waits_for_acceptance() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Refused,
            RequestStatus::Delivered,
        ] {
            let next = transition(
                status,
                Role::Client,
                Command::SendMessage { free_text: true },
                &progress(0),
            );
            assert!(matches!(next, Err(Rejection::Invalid(_))), "{status}");
        }
        let system = transition(
            RequestStatus::Pending,
            Role::Carrier,
            Command::SendMessage { free_text: false },
            &progress(0),
        );
        assert_eq!(system, Ok(RequestStatus::Pending));
    }
}
