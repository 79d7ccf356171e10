//! Conversation models returned by the chat service aggregator (CSA)

use serde::{Deserialize, Serialize};

/// Teams, channels and chats the signed-in user belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub private_feeds: Vec<serde_json::Value>,
}

impl ConversationResponse {
    /// Sort teams case-insensitively by display name.
    pub fn sort_teams(&mut self) {
        self.teams
            .sort_by_key(|team| team.display_name.to_lowercase());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_general: bool,
}

/// Chat entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub title: Option<String>,
    pub chat_type: Option<String>,
    #[serde(default)]
    pub is_one_on_one: bool,
    pub last_message: Option<LastMessage>,
}

impl Chat {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("(untitled chat)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub im_display_name: Option<String>,
    pub compose_time: Option<String>,
}
