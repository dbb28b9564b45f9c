use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Synthetic author of system messages ("Session ended" and friends).
pub const SYSTEM_SENDER_ID: Uuid = Uuid::nil();
pub const SYSTEM_SENDER_NAME: &str = "system";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Voice,
    Screening,
    Roleplay,
}

impl SessionKind {
    pub fn label(&self) -> &'static str {
        match self {
            SessionKind::Voice => "voice room",
            SessionKind::Screening => "screening room",
            SessionKind::Roleplay => "roleplay session",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub role_id: Option<Uuid>,
    #[serde(default)]
    pub character_id: Option<Uuid>,
}

/// Denormalized character entry carried on a roleplay session document so
/// every participant can render the cast without extra profile reads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CharacterCard {
    pub character_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub theme_color: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Session {
    pub id: Uuid,
    pub kind: SessionKind,
    pub community_id: Uuid,
    pub creator_id: Uuid,
    pub title: Option<String>,
    /// The session-link chat message rendered as this session's card.
    #[serde(default)]
    pub card_message_id: Option<Uuid>,
    /// Monotonic: flips true -> false exactly once, never back.
    pub is_active: bool,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub characters: Vec<CharacterCard>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct SessionRef {
    pub session_id: Uuid,
    pub kind: SessionKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "text")]
    Text { body: String },

    #[serde(rename = "image")]
    Image {
        image_url: String,
        #[serde(default)]
        caption: Option<String>,
    },

    #[serde(rename = "video")]
    Video {
        video_url: String,
        #[serde(default)]
        thumbnail_url: Option<String>,
    },

    #[serde(rename = "voice")]
    Voice { audio_url: String, duration_ms: u64 },

    #[serde(rename = "system")]
    System { body: String },

    #[serde(rename = "session_link")]
    SessionLink {
        /// Participant names shown on the card badge; refreshed by the
        /// session registry on join, last-write-wins.
        #[serde(default)]
        participant_names: Vec<String>,
    },

    #[serde(rename = "invite")]
    Invite { community_id: Uuid, note: Option<String> },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub sender_id: Uuid,
    /// Denormalized at send time; display fallback only, never used for
    /// authorization decisions.
    pub sender_name: String,
    /// Server timestamp. None while the optimistic local write is pending.
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_ref: Option<SessionRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoleplayRole {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub taken: bool,
    pub taken_by: Option<Uuid>,
    /// Created ad hoc by a participant rather than predefined at session
    /// creation.
    #[serde(default)]
    pub custom: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CharacterAttributes {
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub height_cm: Option<u32>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Character {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub theme_color: Option<String>,
    #[serde(default)]
    pub attributes: CharacterAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Character {
    pub fn card(&self) -> CharacterCard {
        CharacterCard {
            character_id: self.id,
            owner_id: self.owner_id,
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            theme_color: self.theme_color.clone(),
        }
    }
}

/// Latest published audio chunk for one participant in one session.
/// Overwritten in place on every publish; consumers detect a new chunk by
/// URL inequality, never by queue position.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AudioSlot {
    pub user_id: Uuid,
    pub audio_url: String,
    /// Server-resolved publish time; staleness is judged against this.
    pub published_at: DateTime<Utc>,
    /// Last-known speaking state. Sticky: nothing clears it except the next
    /// chunk write, so it may go stale after the speaker mutes.
    pub is_speaking: bool,
}

impl AudioSlot {
    pub fn timestamp_ms(&self) -> i64 {
        self.published_at.timestamp_millis()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserProfile {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Community {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
    #[serde(default)]
    pub moderator_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_round_trips_with_tag() {
        let msg = ChatMessage {
            id: Uuid::new_v4(),
            kind: MessageKind::SessionLink {
                participant_names: vec!["ada".into()],
            },
            sender_id: Uuid::new_v4(),
            sender_name: "ada".into(),
            created_at: Some(Utc::now()),
            session_ref: Some(SessionRef {
                session_id: Uuid::new_v4(),
                kind: SessionKind::Voice,
            }),
        };

        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "session_link");

        let back: ChatMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.kind, msg.kind);
    }

    #[test]
    fn unknown_optional_fields_default() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "type": "text",
            "body": "hey",
            "sender_id": Uuid::new_v4(),
            "sender_name": "grace",
            "created_at": null,
        });

        let msg: ChatMessage = serde_json::from_value(json).expect("deserialize");
        assert!(msg.created_at.is_none());
        assert!(msg.session_ref.is_none());
    }
}
