use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::chat::post_message;
use crate::errors::AppError;
use crate::identity::IdentityResolver;
use crate::models::{
    ChatMessage, Community, MessageKind, Participant, RoleplayRole, Session, SessionKind,
    SessionRef, SYSTEM_SENDER_ID, SYSTEM_SENDER_NAME,
};
use crate::paths;
use crate::store::{server_timestamp, DocumentStore, StoreError, TxDecision};
use crate::telemetry::Telemetry;

const MAX_TITLE_CHARS: usize = 100;

/// Predefined roleplay role written alongside the session document.
#[derive(Debug, Clone)]
pub struct RoleSeed {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub title: Option<String>,
    pub roles: Vec<RoleSeed>,
}

/// Creates, tracks and terminates the three session kinds. Owns the
/// `is_active` transition and the participant set.
pub struct SessionRegistry {
    store: Arc<dyn DocumentStore>,
    identity: Arc<IdentityResolver>,
    telemetry: Arc<Telemetry>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<IdentityResolver>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            identity,
            telemetry,
        }
    }

    #[tracing::instrument(skip(self, metadata), fields(kind = ?kind, community_id = %community_id))]
    pub async fn create_session(
        &self,
        kind: SessionKind,
        creator_id: Uuid,
        community_id: Uuid,
        metadata: SessionMetadata,
    ) -> Result<Session, AppError> {
        if creator_id.is_nil() {
            return Err(AppError::BadRequest("A session needs a creator".into()));
        }
        if community_id.is_nil() {
            return Err(AppError::BadRequest(
                "A session must belong to a community".into(),
            ));
        }

        let title = match metadata.title.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => {
                if value.chars().count() > MAX_TITLE_CHARS {
                    return Err(AppError::BadRequest(format!(
                        "Session title must be {MAX_TITLE_CHARS} characters or fewer"
                    )));
                }
                Some(value.to_string())
            }
            _ => None,
        };

        let profile = self
            .identity
            .resolve_or_fallback(creator_id, "unknown")
            .await;

        let session_id = Uuid::new_v4();
        let card_message_id = Uuid::new_v4();
        let creator = Participant {
            user_id: creator_id,
            display_name: profile.display_name.clone(),
            avatar_url: profile.avatar_url,
            joined_at: Utc::now(),
            role_id: None,
            character_id: None,
        };

        let session = Session {
            id: session_id,
            kind,
            community_id,
            creator_id,
            title,
            card_message_id: Some(card_message_id),
            is_active: true,
            participants: vec![creator],
            characters: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut value = serde_json::to_value(&session)?;
        value["created_at"] = server_timestamp();
        value["updated_at"] = server_timestamp();

        let started = Instant::now();
        self.store.set(&paths::session(session_id), value).await?;
        self.telemetry
            .observe_store_call("sessions.create.set", started.elapsed());

        for seed in &metadata.roles {
            let role = RoleplayRole {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                description: seed.description.clone(),
                taken: false,
                taken_by: None,
                custom: false,
            };
            self.store
                .set(
                    &paths::role(session_id, role.id),
                    serde_json::to_value(&role)?,
                )
                .await?;
        }

        let card = ChatMessage {
            id: card_message_id,
            kind: MessageKind::SessionLink {
                participant_names: vec![profile.display_name],
            },
            sender_id: creator_id,
            sender_name: session
                .participants
                .first()
                .map(|p| p.display_name.clone())
                .unwrap_or_default(),
            created_at: None,
            session_ref: Some(SessionRef { session_id, kind }),
        };
        post_message(self.store.as_ref(), community_id, &card).await?;

        tracing::info!(
            session_id = %session_id,
            kind = ?kind,
            "Created session with paired chat card"
        );

        // Read back so the returned record carries the resolved server
        // timestamps rather than the local clock.
        let doc = self
            .store
            .get(&paths::session(session_id))
            .await?
            .ok_or_else(|| AppError::Internal("Session vanished after create".into()))?;
        Ok(doc.decode::<Session>().map_err(AppError::from)?)
    }

    #[tracing::instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    pub async fn join_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Participant, AppError> {
        let profile = self.identity.resolve_or_fallback(user_id, "unknown").await;

        let path = paths::session(session_id);
        let mut outcome: Option<Result<Participant, AppError>> = None;
        let mut badge_names: Option<Vec<String>> = None;

        let started = Instant::now();
        self.store
            .run_transaction(Box::new(|tx| {
                let Some(doc) = tx.get(&path)? else {
                    outcome = Some(Err(AppError::NotFound("Room no longer exists".into())));
                    return Ok(TxDecision::Abort);
                };
                let mut session: Session = doc.decode()?;

                if !session.is_active {
                    outcome = Some(Err(AppError::Inactive("Room has ended".into())));
                    return Ok(TxDecision::Abort);
                }

                // Rejoin after a disconnect reuses the existing record.
                if let Some(existing) = session.participant(user_id) {
                    outcome = Some(Ok(existing.clone()));
                    return Ok(TxDecision::Abort);
                }

                let participant = Participant {
                    user_id,
                    display_name: profile.display_name.clone(),
                    avatar_url: profile.avatar_url.clone(),
                    joined_at: Utc::now(),
                    role_id: None,
                    character_id: None,
                };
                session.participants.push(participant.clone());

                let mut value = serde_json::to_value(&session)
                    .map_err(|error| StoreError::Backend(error.to_string()))?;
                value["updated_at"] = server_timestamp();
                tx.set(&path, value)?;

                badge_names = Some(
                    session
                        .participants
                        .iter()
                        .map(|p| p.display_name.clone())
                        .collect(),
                );
                outcome = Some(Ok(participant));
                Ok(TxDecision::Commit)
            }))
            .await?;
        self.telemetry
            .observe_store_call("sessions.join.tx", started.elapsed());

        let participant = outcome
            .unwrap_or_else(|| Err(AppError::Internal("Join transaction produced no result".into())))?;

        if let Some(names) = badge_names {
            self.refresh_card_badge(session_id, names).await;
        }

        Ok(participant)
    }

    #[tracing::instrument(skip(self), fields(session_id = %session_id, actor_id = %actor_id))]
    pub async fn end_session(&self, session_id: Uuid, actor_id: Uuid) -> Result<(), AppError> {
        let path = paths::session(session_id);

        let mut attempt = 0;
        loop {
            let mut outcome: Option<Result<EndOutcome, AppError>> = None;

            let result = self
                .store
                .run_transaction(Box::new(|tx| {
                    let Some(doc) = tx.get(&path)? else {
                        outcome = Some(Err(AppError::NotFound("Room no longer exists".into())));
                        return Ok(TxDecision::Abort);
                    };
                    let session: Session = doc.decode()?;

                    // Ending an already-ended session is a no-op, not an error.
                    if !session.is_active {
                        outcome = Some(Ok(EndOutcome::AlreadyEnded));
                        return Ok(TxDecision::Abort);
                    }

                    if session.creator_id != actor_id {
                        let community = tx
                            .get(&paths::community(session.community_id))?
                            .map(|doc| doc.decode::<Community>())
                            .transpose()?;
                        let is_moderator = community
                            .map(|c| c.moderator_ids.contains(&actor_id))
                            .unwrap_or(false);
                        if !is_moderator {
                            outcome = Some(Err(AppError::PermissionDenied(
                                "Only the host or a moderator can end this room".into(),
                            )));
                            return Ok(TxDecision::Abort);
                        }
                    }

                    let mut fields = Map::new();
                    fields.insert("is_active".to_string(), Value::Bool(false));
                    fields.insert("updated_at".to_string(), server_timestamp());
                    tx.update(&path, fields)?;

                    outcome = Some(Ok(EndOutcome::Ended {
                        community_id: session.community_id,
                        kind: session.kind,
                    }));
                    Ok(TxDecision::Commit)
                }))
                .await;

            match result {
                Ok(_) => {
                    let ended = outcome.unwrap_or_else(|| {
                        Err(AppError::Internal("End transaction produced no result".into()))
                    })?;

                    if let EndOutcome::Ended { community_id, kind } = ended {
                        self.post_ended_notice(community_id, session_id, kind).await;
                    }
                    return Ok(());
                }
                Err(StoreError::TxAborted) if attempt == 0 => {
                    attempt += 1;
                    self.telemetry.inc_tx_retry();
                    tracing::debug!(session_id = %session_id, "Retrying end_session after aborted transaction");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    #[tracing::instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    pub async fn leave_session(&self, session_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        let path = paths::session(session_id);
        let mut outcome: Option<Result<(), AppError>> = None;
        let mut badge_names: Option<Vec<String>> = None;

        self.store
            .run_transaction(Box::new(|tx| {
                let Some(doc) = tx.get(&path)? else {
                    outcome = Some(Err(AppError::NotFound("Room no longer exists".into())));
                    return Ok(TxDecision::Abort);
                };
                let mut session: Session = doc.decode()?;

                let before = session.participants.len();
                session.participants.retain(|p| p.user_id != user_id);
                if session.participants.len() == before {
                    outcome = Some(Ok(()));
                    return Ok(TxDecision::Abort);
                }

                let mut value = serde_json::to_value(&session)
                    .map_err(|error| StoreError::Backend(error.to_string()))?;
                value["updated_at"] = server_timestamp();
                tx.set(&path, value)?;

                badge_names = Some(
                    session
                        .participants
                        .iter()
                        .map(|p| p.display_name.clone())
                        .collect(),
                );
                outcome = Some(Ok(()));
                Ok(TxDecision::Commit)
            }))
            .await?;

        outcome.unwrap_or_else(|| {
            Err(AppError::Internal("Leave transaction produced no result".into()))
        })?;

        if let Some(names) = badge_names {
            self.refresh_card_badge(session_id, names).await;
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Session, AppError> {
        let doc = self
            .store
            .get(&paths::session(session_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Room no longer exists".into()))?;
        doc.decode::<Session>().map_err(AppError::from)
    }

    /// Last-write-wins refresh of the session card's participant badge.
    /// Purely cosmetic; a failure is logged and absorbed.
    async fn refresh_card_badge(&self, session_id: Uuid, names: Vec<String>) {
        let session = match self.get_session(session_id).await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = ?error, "Card badge refresh skipped");
                return;
            }
        };
        let Some(card_message_id) = session.card_message_id else {
            return;
        };

        let mut fields = Map::new();
        fields.insert(
            "participant_names".to_string(),
            serde_json::to_value(&names).unwrap_or(Value::Array(Vec::new())),
        );

        if let Err(error) = self
            .store
            .update(&paths::message(session.community_id, card_message_id), fields)
            .await
        {
            tracing::warn!(
                session_id = %session_id,
                message_id = %card_message_id,
                error = ?error,
                "Failed to refresh session card badge"
            );
        }
    }

    async fn post_ended_notice(&self, community_id: Uuid, session_id: Uuid, kind: SessionKind) {
        let notice = ChatMessage {
            id: Uuid::new_v4(),
            kind: MessageKind::System {
                body: "Session ended".into(),
            },
            sender_id: SYSTEM_SENDER_ID,
            sender_name: SYSTEM_SENDER_NAME.into(),
            created_at: None,
            session_ref: Some(SessionRef { session_id, kind }),
        };

        // The ended flag is already committed; a lost notice only costs the
        // chat entry, so log and move on.
        if let Err(error) = post_message(self.store.as_ref(), community_id, &notice).await {
            tracing::warn!(
                session_id = %session_id,
                error = ?error,
                "Failed to post session-ended notice"
            );
        }
    }
}

enum EndOutcome {
    Ended {
        community_id: Uuid,
        kind: SessionKind,
    },
    AlreadyEnded,
}
