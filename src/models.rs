// models.rs
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Identifies one open WebSocket connection. Assigned in connection order.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

/// A joined connection as shown in the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub name: String,
    pub role: Role,
    pub answered: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(name: String, role: Role) -> Self {
        Self {
            name,
            role,
            answered: false,
            joined_at: Utc::now(),
        }
    }

    pub fn is_student(&self) -> bool {
        self.role == Role::Student
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    /// Seconds; 0 means the poll only closes on completion or by the teacher.
    pub time_limit: u64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_active: bool,
}

impl Poll {
    pub fn new(
        question: String,
        options: Vec<String>,
        time_limit: u64,
        created_by: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question,
            options,
            time_limit,
            created_at: Utc::now(),
            created_by,
            is_active: true,
        }
    }
}

/// Vote counts per option label, kept in the poll's option order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    counts: Vec<(String, u64)>,
}

impl Tally {
    pub fn for_options(options: &[String]) -> Self {
        Self {
            counts: options.iter().map(|option| (option.clone(), 0)).collect(),
        }
    }

    /// Rebuilds a tally from stored counts; options missing from `counts` are zero.
    pub fn from_counts(options: &[String], counts: &HashMap<String, u64>) -> Self {
        Self {
            counts: options
                .iter()
                .map(|option| (option.clone(), counts.get(option).copied().unwrap_or(0)))
                .collect(),
        }
    }

    pub fn contains(&self, option: &str) -> bool {
        self.counts.iter().any(|(label, _)| label == option)
    }

    pub fn get(&self, option: &str) -> Option<u64> {
        self.counts
            .iter()
            .find(|(label, _)| label == option)
            .map(|(_, count)| *count)
    }

    /// Adds one vote. Returns false if the option is not part of this tally.
    pub fn record(&mut self, option: &str) -> bool {
        match self.counts.iter_mut().find(|(label, _)| label == option) {
            Some((_, count)) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, count)| count).sum()
    }
}

impl Serialize for Tally {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.counts.len()))?;
        for (label, count) in &self.counts {
            map.serialize_entry(label, count)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A poll together with its results, as written to history when it closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRecord {
    #[serde(flatten)]
    pub poll: Poll,
    pub results: Tally,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_answers: usize,
    pub total_students: usize,
}

/// What `/api/active-poll` reports: the live poll (if any) and the latest tally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePollView {
    pub poll: Option<Poll>,
    pub results: Tally,
}

/// One answer in a participant's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipationEntry {
    pub poll_id: Uuid,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}
