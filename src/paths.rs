//! Document paths for every collection the client touches.

use uuid::Uuid;

pub fn community(community_id: Uuid) -> String {
    format!("communities/{community_id}")
}

pub fn messages_collection(community_id: Uuid) -> String {
    format!("communities/{community_id}/messages")
}

pub fn message(community_id: Uuid, message_id: Uuid) -> String {
    format!("communities/{community_id}/messages/{message_id}")
}

pub fn session(session_id: Uuid) -> String {
    format!("sessions/{session_id}")
}

pub fn roles_collection(session_id: Uuid) -> String {
    format!("sessions/{session_id}/roles")
}

pub fn role(session_id: Uuid, role_id: Uuid) -> String {
    format!("sessions/{session_id}/roles/{role_id}")
}

pub fn audio_collection(session_id: Uuid) -> String {
    format!("sessions/{session_id}/audio")
}

pub fn audio_slot(session_id: Uuid, user_id: Uuid) -> String {
    format!("sessions/{session_id}/audio/{user_id}")
}

pub fn user(user_id: Uuid) -> String {
    format!("users/{user_id}")
}

pub fn characters_collection(owner_id: Uuid) -> String {
    format!("users/{owner_id}/characters")
}

pub fn character(owner_id: Uuid, character_id: Uuid) -> String {
    format!("users/{owner_id}/characters/{character_id}")
}
