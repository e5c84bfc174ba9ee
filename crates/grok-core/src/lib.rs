use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod collaborators;
pub mod content;
pub mod mention_contracts;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MentionStatus {
    Pending,
    Processing,
    Replied,
    Failed,
    Skipped,
}

impl Default for MentionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl MentionStatus {
    pub const ALL: [MentionStatus; 5] = [
        MentionStatus::Pending,
        MentionStatus::Processing,
        MentionStatus::Replied,
        MentionStatus::Failed,
        MentionStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MentionStatus::Pending => "pending",
            MentionStatus::Processing => "processing",
            MentionStatus::Replied => "replied",
            MentionStatus::Failed => "failed",
            MentionStatus::Skipped => "skipped",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MentionStatus::Replied | MentionStatus::Failed | MentionStatus::Skipped
        )
    }
}

impl fmt::Display for MentionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MentionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(MentionStatus::Pending),
            "processing" => Ok(MentionStatus::Processing),
            "replied" => Ok(MentionStatus::Replied),
            "failed" => Ok(MentionStatus::Failed),
            "skipped" => Ok(MentionStatus::Skipped),
            other => Err(format!("Unknown mention status: {other}")),
        }
    }
}

/// Deserialize an ID that can be either a string or a number into a String
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Deserialize an optional numeric ID where 0, null and "" all mean "absent".
pub fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    let id = match val {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(_) => {
            return Err(serde::de::Error::custom(
                "expected string or number for id",
            ))
        }
    };
    Ok(id.filter(|value| !value.is_empty() && value != "0"))
}
