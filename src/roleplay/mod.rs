use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Character, CharacterAttributes, RoleplayRole, Session};
use crate::paths;
use crate::store::{
    server_timestamp, DocumentStore, Query, SortDirection, StoreError, TxDecision,
};
use crate::telemetry::Telemetry;

const MAX_NAME_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub enum RoleChoice {
    Existing(Uuid),
    Custom { name: String, description: String },
}

#[derive(Debug, Clone, Default)]
pub struct CharacterDraft {
    /// None creates a new character; Some updates the matching one.
    pub id: Option<Uuid>,
    pub name: String,
    pub avatar_url: Option<String>,
    pub theme_color: Option<String>,
    pub attributes: CharacterAttributes,
}

/// Gates entry into roleplay sessions behind role/character selection and
/// manages the creator-owned character catalogue.
pub struct RoleBinder {
    store: Arc<dyn DocumentStore>,
    telemetry: Arc<Telemetry>,
}

impl RoleBinder {
    pub fn new(store: Arc<dyn DocumentStore>, telemetry: Arc<Telemetry>) -> Self {
        Self { store, telemetry }
    }

    pub async fn list_available_roles(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<RoleplayRole>, AppError> {
        let query = Query::collection(paths::roles_collection(session_id))
            .filter("taken", Value::Bool(false))
            .order_by("name", SortDirection::Ascending);

        let started = Instant::now();
        let docs = self.store.query(&query).await?;
        self.telemetry
            .observe_store_call("roleplay.list_roles", started.elapsed());

        let mut roles = Vec::with_capacity(docs.len());
        for doc in docs {
            roles.push(doc.decode::<RoleplayRole>()?);
        }
        Ok(roles)
    }

    /// Claims a role for `user_id`, atomically: a concurrent claim on the
    /// same role leaves exactly one winner, the loser gets `Conflict`.
    #[tracing::instrument(skip(self, choice), fields(session_id = %session_id, user_id = %user_id))]
    pub async fn claim_role(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        choice: RoleChoice,
    ) -> Result<RoleplayRole, AppError> {
        if let RoleChoice::Custom { name, .. } = &choice {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest("Role name cannot be empty".into()));
            }
            if trimmed.chars().count() > MAX_NAME_CHARS {
                return Err(AppError::BadRequest(format!(
                    "Role name must be {MAX_NAME_CHARS} characters or fewer"
                )));
            }
        }

        let session_path = paths::session(session_id);
        let mut attempt = 0;
        loop {
            let mut outcome: Option<Result<RoleplayRole, AppError>> = None;
            let choice = choice.clone();

            let result = self
                .store
                .run_transaction(Box::new(|tx| {
                    let Some(session_doc) = tx.get(&session_path)? else {
                        outcome = Some(Err(AppError::NotFound("Room no longer exists".into())));
                        return Ok(TxDecision::Abort);
                    };
                    let mut session: Session = session_doc.decode()?;
                    if !session.is_active {
                        outcome = Some(Err(AppError::Inactive("Room has ended".into())));
                        return Ok(TxDecision::Abort);
                    }

                    let role = match &choice {
                        RoleChoice::Existing(role_id) => {
                            let role_path = paths::role(session_id, *role_id);
                            let Some(role_doc) = tx.get(&role_path)? else {
                                outcome =
                                    Some(Err(AppError::NotFound("Role no longer exists".into())));
                                return Ok(TxDecision::Abort);
                            };
                            let mut role: RoleplayRole = role_doc.decode()?;

                            if role.taken {
                                outcome =
                                    Some(Err(AppError::Conflict("Role already taken".into())));
                                return Ok(TxDecision::Abort);
                            }

                            role.taken = true;
                            role.taken_by = Some(user_id);
                            let value = serde_json::to_value(&role)
                                .map_err(|error| StoreError::Backend(error.to_string()))?;
                            tx.set(&role_path, value)?;
                            role
                        }
                        RoleChoice::Custom { name, description } => {
                            let role = RoleplayRole {
                                id: Uuid::new_v4(),
                                name: name.trim().to_string(),
                                description: description.trim().to_string(),
                                taken: true,
                                taken_by: Some(user_id),
                                custom: true,
                            };
                            let value = serde_json::to_value(&role)
                                .map_err(|error| StoreError::Backend(error.to_string()))?;
                            tx.set(&paths::role(session_id, role.id), value)?;
                            role
                        }
                    };

                    // Bind the claim onto the participant record when the
                    // user already joined; claiming before joining is fine.
                    if let Some(participant) = session
                        .participants
                        .iter_mut()
                        .find(|p| p.user_id == user_id)
                    {
                        participant.role_id = Some(role.id);
                        let mut value = serde_json::to_value(&session)
                            .map_err(|error| StoreError::Backend(error.to_string()))?;
                        value["updated_at"] = server_timestamp();
                        tx.set(&session_path, value)?;
                    }

                    outcome = Some(Ok(role));
                    Ok(TxDecision::Commit)
                }))
                .await;

            match result {
                Ok(_) => {
                    return outcome.unwrap_or_else(|| {
                        Err(AppError::Internal(
                            "Claim transaction produced no result".into(),
                        ))
                    });
                }
                Err(StoreError::TxAborted) if attempt == 0 => {
                    attempt += 1;
                    self.telemetry.inc_tx_retry();
                    tracing::debug!(session_id = %session_id, "Retrying claim_role after aborted transaction");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Attaches one of the user's characters to their participant record.
    /// Switching mid-session replaces the user's entries in the session's
    /// character list while leaving the participant record untouched.
    #[tracing::instrument(skip(self), fields(session_id = %session_id, user_id = %user_id, character_id = %character_id))]
    pub async fn bind_character(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<(), AppError> {
        let character_doc = self
            .store
            .get(&paths::character(user_id, character_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Character not found".into()))?;
        let character: Character = character_doc.decode()?;

        let session_path = paths::session(session_id);
        let mut outcome: Option<Result<(), AppError>> = None;

        self.store
            .run_transaction(Box::new(|tx| {
                let Some(session_doc) = tx.get(&session_path)? else {
                    outcome = Some(Err(AppError::NotFound("Room no longer exists".into())));
                    return Ok(TxDecision::Abort);
                };
                let mut session: Session = session_doc.decode()?;
                if !session.is_active {
                    outcome = Some(Err(AppError::Inactive("Room has ended".into())));
                    return Ok(TxDecision::Abort);
                }

                let Some(participant) = session
                    .participants
                    .iter_mut()
                    .find(|p| p.user_id == user_id)
                else {
                    outcome = Some(Err(AppError::BadRequest(
                        "Join the room before choosing a character".into(),
                    )));
                    return Ok(TxDecision::Abort);
                };
                participant.character_id = Some(character.id);

                // Character switch: drop this user's previous contributions,
                // keep everyone else's, append the new selection.
                session.characters.retain(|card| card.owner_id != user_id);
                session.characters.push(character.card());

                let mut value = serde_json::to_value(&session)
                    .map_err(|error| StoreError::Backend(error.to_string()))?;
                value["updated_at"] = server_timestamp();
                tx.set(&session_path, value)?;

                outcome = Some(Ok(()));
                Ok(TxDecision::Commit)
            }))
            .await?;

        outcome.unwrap_or_else(|| {
            Err(AppError::Internal(
                "Bind transaction produced no result".into(),
            ))
        })
    }

    /// Create or update a character in the owner's catalogue. Updates
    /// replace every mutable field and preserve id, owner and created_at.
    pub async fn save_character(
        &self,
        owner_id: Uuid,
        draft: CharacterDraft,
    ) -> Result<Character, AppError> {
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("Character name cannot be empty".into()));
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(AppError::BadRequest(format!(
                "Character name must be {MAX_NAME_CHARS} characters or fewer"
            )));
        }

        let (character_id, created_at_value) = match draft.id {
            Some(id) => {
                let existing = self
                    .store
                    .get(&paths::character(owner_id, id))
                    .await?
                    .ok_or_else(|| AppError::NotFound("Character not found".into()))?;
                let created_at = existing
                    .data
                    .get("created_at")
                    .cloned()
                    .unwrap_or_else(server_timestamp);
                (id, created_at)
            }
            None => (Uuid::new_v4(), server_timestamp()),
        };

        let character = Character {
            id: character_id,
            owner_id,
            name: name.to_string(),
            avatar_url: draft.avatar_url,
            theme_color: draft.theme_color,
            attributes: draft.attributes,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let mut value = serde_json::to_value(&character)?;
        value["created_at"] = created_at_value;
        value["updated_at"] = server_timestamp();

        let path = paths::character(owner_id, character_id);
        let started = Instant::now();
        self.store.set(&path, value).await?;
        self.telemetry
            .observe_store_call("roleplay.save_character", started.elapsed());

        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::Internal("Character vanished after save".into()))?;
        doc.decode::<Character>().map_err(AppError::from)
    }

    pub async fn list_characters(&self, owner_id: Uuid) -> Result<Vec<Character>, AppError> {
        let query = Query::collection(paths::characters_collection(owner_id))
            .order_by("name", SortDirection::Ascending);
        let docs = self.store.query(&query).await?;

        let mut characters = Vec::with_capacity(docs.len());
        for doc in docs {
            characters.push(doc.decode::<Character>()?);
        }
        Ok(characters)
    }

    pub async fn delete_character(
        &self,
        owner_id: Uuid,
        character_id: Uuid,
    ) -> Result<(), AppError> {
        self.store
            .delete(&paths::character(owner_id, character_id))
            .await?;
        Ok(())
    }
}
