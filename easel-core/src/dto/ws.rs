//! WebSocket frames exchanged with observers
//!
//! Inbound: `{"subscribe": "<job-id>"}`.
//! Outbound: `{"subscribed": "<job-id>"}` and `{"job": "running" | "done"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Job status pushed to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobUpdate {
    Running,
    Done,
}

/// Frame sent from the server to an observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFrame {
    Subscribed(Uuid),
    Job(JobUpdate),
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        // Externally tagged enums of strings always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Raw inbound frame: a map of command name to argument
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ClientFrame(pub BTreeMap<String, Value>);

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Recognized commands in this frame; unknown command names are skipped
    pub fn commands(&self) -> impl Iterator<Item = Result<ClientCommand, CommandError>> + '_ {
        self.0
            .iter()
            .filter_map(|(name, arg)| ClientCommand::from_entry(name, arg))
    }
}

/// Command understood by the connection receive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(Uuid),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command}: argument must be a string, got {arg}")]
    NotAString { command: String, arg: Value },

    #[error("{command}: invalid job id {raw:?}: {source}")]
    InvalidJobId {
        command: String,
        raw: String,
        source: uuid::Error,
    },
}

impl ClientCommand {
    /// Returns `None` for commands this version does not know
    pub fn from_entry(name: &str, arg: &Value) -> Option<Result<Self, CommandError>> {
        match name {
            "subscribe" => Some(parse_job_id(name, arg).map(ClientCommand::Subscribe)),
            _ => None,
        }
    }
}

fn parse_job_id(command: &str, arg: &Value) -> Result<Uuid, CommandError> {
    let raw = arg.as_str().ok_or_else(|| CommandError::NotAString {
        command: command.to_string(),
        arg: arg.clone(),
    })?;

    Uuid::parse_str(raw).map_err(|source| CommandError::InvalidJobId {
        command: command.to_string(),
        raw: raw.to_string(),
        source,
    })
}
