// src/events.rs
//! WebSocket wire format.
//!
//! Every frame is a JSON text message of the form `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PollError;
use crate::models::{ChatMessage, Participant, Poll, Role, Tally};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub time_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerRequest {
    pub selected_option: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveStudentRequest {
    pub student_name: String,
}

/// Actions a participant can request over its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Join(JoinRequest),
    CreatePoll(CreatePollRequest),
    SubmitAnswer(SubmitAnswerRequest),
    EndPoll,
    SendMessage(SendMessageRequest),
    RemoveStudent(RemoveStudentRequest),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, PollError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| PollError::Validation(format!("Malformed message: {e}")))?;

        let event = match envelope.event.as_str() {
            "join" => ClientEvent::Join(payload(&envelope)?),
            "create-poll" => ClientEvent::CreatePoll(payload(&envelope)?),
            "submit-answer" => ClientEvent::SubmitAnswer(payload(&envelope)?),
            "end-poll" => ClientEvent::EndPoll,
            "send-message" => ClientEvent::SendMessage(payload(&envelope)?),
            "remove-student" => ClientEvent::RemoveStudent(payload(&envelope)?),
            other => return Err(PollError::Validation(format!("Unknown event: {other}"))),
        };

        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::CreatePoll(_) => "create-poll",
            ClientEvent::SubmitAnswer(_) => "submit-answer",
            ClientEvent::EndPoll => "end-poll",
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::RemoveStudent(_) => "remove-student",
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(envelope: &Envelope) -> Result<T, PollError> {
    T::deserialize(&envelope.data)
        .map_err(|e| PollError::Validation(format!("Invalid {} payload: {e}", envelope.event)))
}

/// Sent to a connection that just joined.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    pub active_poll: Option<Poll>,
    pub tally: Tally,
    pub roster: Vec<Participant>,
    pub has_answered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    PollState(PollState),
    UsersUpdated(Vec<Participant>),
    NewPoll {
        poll: Poll,
        tally: Tally,
    },
    #[serde(rename_all = "camelCase")]
    PollResultsUpdated {
        tally: Tally,
        answered_count: usize,
        total_students: usize,
    },
    PollEnded {
        poll: Poll,
        tally: Tally,
    },
    NewMessage(ChatMessage),
    Error {
        message: String,
    },
    RemovedByTeacher,
}

impl From<&PollError> for ServerEvent {
    fn from(err: &PollError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
        }
    }
}

/// What the coordinator pushes into a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Send a close frame and drop the connection.
    Close,
}
