//! JSON codec for the client channel.
//!
//! Every frame is a JSON array whose first element names the action.
//! Inbound frames carry positional arguments, outbound frames carry a
//! single payload object.
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Frame is not a JSON array")]
    NotAnArray,

    #[error("Frame has no action name")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid arguments for {action}: {reason}")]
    InvalidArguments { action: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Commands sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `["update_threshold", values, index]`
    UpdateThreshold { values: Vec<i32>, index: usize },
    /// `["add_profile", name, thresholds]`
    AddProfile { name: String, thresholds: Vec<i32> },
    /// `["remove_profile", name]`
    RemoveProfile { name: String },
    /// `["change_profile", name]`
    ChangeProfile { name: String },
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self> {
        let frame: Value = serde_json::from_str(text)?;
        let items = frame.as_array().ok_or(CommandError::NotAnArray)?;
        let (action, args) = items.split_first().ok_or(CommandError::MissingAction)?;
        let action = action.as_str().ok_or(CommandError::MissingAction)?;

        match action {
            "update_threshold" => {
                let [values, index] = expect_args::<2>(action, args)?;
                Ok(ClientCommand::UpdateThreshold {
                    values: int_vec(action, values)?,
                    index: index
                        .as_u64()
                        .map(|i| i as usize)
                        .ok_or_else(|| invalid(action, "index must be a non-negative integer"))?,
                })
            }
            "add_profile" => {
                let [name, thresholds] = expect_args::<2>(action, args)?;
                Ok(ClientCommand::AddProfile {
                    name: string_arg(action, name)?,
                    thresholds: int_vec(action, thresholds)?,
                })
            }
            "remove_profile" => {
                let [name] = expect_args::<1>(action, args)?;
                Ok(ClientCommand::RemoveProfile { name: string_arg(action, name)? })
            }
            "change_profile" => {
                let [name] = expect_args::<1>(action, args)?;
                Ok(ClientCommand::ChangeProfile { name: string_arg(action, name)? })
            }
            other => Err(CommandError::UnknownAction(other.to_string())),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ClientCommand::UpdateThreshold { .. } => "update_threshold",
            ClientCommand::AddProfile { .. } => "add_profile",
            ClientCommand::RemoveProfile { .. } => "remove_profile",
            ClientCommand::ChangeProfile { .. } => "change_profile",
        }
    }
}

fn invalid(action: &str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidArguments {
        action: action.to_string(),
        reason: reason.into(),
    }
}

fn expect_args<'a, const K: usize>(action: &str, args: &'a [Value]) -> Result<&'a [Value; K]> {
    args.try_into()
        .map_err(|_| invalid(action, format!("expected {} arguments, got {}", K, args.len())))
}

fn string_arg(action: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(action, "expected a string"))
}

fn int_vec(action: &str, value: &Value) -> Result<Vec<i32>> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(action, "expected an array of integers"))?;
    items
        .iter()
        .map(|item| {
            item.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| invalid(action, format!("{} is not a 32-bit integer", item)))
        })
        .collect()
}

/// Messages pushed to every client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Values(Vec<i32>),
    Thresholds(Vec<i32>),
    Profiles(Vec<String>),
    CurrentProfile(String),
}

impl ServerMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ServerMessage::Values(_) => "values",
            ServerMessage::Thresholds(_) => "thresholds",
            ServerMessage::Profiles(_) => "get_profiles",
            ServerMessage::CurrentProfile(_) => "get_cur_profile",
        }
    }

    pub fn to_json(&self) -> Value {
        let payload = match self {
            ServerMessage::Values(values) => json!({ "values": values }),
            ServerMessage::Thresholds(thresholds) => json!({ "thresholds": thresholds }),
            ServerMessage::Profiles(profiles) => json!({ "profiles": profiles }),
            ServerMessage::CurrentProfile(name) => json!({ "cur_profile": name }),
        };
        json!([self.action(), payload])
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}
