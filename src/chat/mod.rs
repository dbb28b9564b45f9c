use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::errors::AppError;
use crate::identity::IdentityResolver;
use crate::models::{ChatMessage, MessageKind, Session, SessionKind, UserProfile};
use crate::paths;
use crate::store::{server_timestamp, Document, DocumentStore, Query, SortDirection};
use crate::telemetry::Telemetry;

const MAX_MESSAGE_CHARS: usize = 4000;

/// Live state of the session a session-link message points at, resolved per
/// snapshot. An ended or missing session still renders, but the join
/// affordance is suppressed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCardState {
    pub kind: SessionKind,
    pub joinable: bool,
}

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub message: ChatMessage,
    pub sender: UserProfile,
    pub session_card: Option<SessionCardState>,
}

/// Handle for one community's live message view. Dropping it cancels the
/// pump task and unsubscribes from the store.
pub struct ChatSubscription {
    receiver: mpsc::UnboundedReceiver<Vec<RenderedMessage>>,
    pub(crate) task: JoinHandle<()>,
    _guard: DropGuard,
}

impl ChatSubscription {
    pub async fn next(&mut self) -> Option<Vec<RenderedMessage>> {
        self.receiver.recv().await
    }
}

impl futures_util::Stream for ChatSubscription {
    type Item = Vec<RenderedMessage>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Maintains the ordered view of a community's message log and resolves
/// sender identity before anything reaches the UI.
pub struct ChatStreamManager {
    store: Arc<dyn DocumentStore>,
    identity: Arc<IdentityResolver>,
    telemetry: Arc<Telemetry>,
}

impl ChatStreamManager {
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

    pub async fn subscribe(&self, community_id: Uuid) -> Result<ChatSubscription, AppError> {
        let query = Query::collection(paths::messages_collection(community_id))
            .order_by("created_at", SortDirection::Ascending);

        let mut snapshots = self.store.subscribe(query).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let store = self.store.clone();
        let identity = self.identity.clone();
        let telemetry = self.telemetry.clone();

        let task = tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    _ = child.cancelled() => break,
                    snapshot = snapshots.recv() => match snapshot {
                        Some(snapshot) => snapshot,
                        None => break,
                    },
                };

                let rendered =
                    render_snapshot(store.as_ref(), &identity, &telemetry, snapshot).await;
                if tx.send(rendered).is_err() {
                    break;
                }
            }
            tracing::debug!(community_id = %community_id, "Chat subscription pump stopped");
        });

        Ok(ChatSubscription {
            receiver: rx,
            task,
            _guard: cancel.drop_guard(),
        })
    }

    /// Appends a message to the community log. The returned record is the
    /// optimistic local echo: `created_at` stays `None` until the store
    /// commit resolves the server timestamp.
    pub async fn send_message(
        &self,
        community_id: Uuid,
        sender_id: Uuid,
        kind: MessageKind,
    ) -> Result<ChatMessage, AppError> {
        if let MessageKind::Text { body } | MessageKind::System { body } = &kind {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest("Message cannot be empty".into()));
            }
            if trimmed.chars().count() > MAX_MESSAGE_CHARS {
                return Err(AppError::BadRequest(format!(
                    "Message must be {MAX_MESSAGE_CHARS} characters or fewer"
                )));
            }
        }

        let profile = self
            .identity
            .resolve_or_fallback(sender_id, "unknown")
            .await;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            kind,
            sender_id,
            sender_name: profile.display_name,
            created_at: None,
            session_ref: None,
        };

        post_message(self.store.as_ref(), community_id, &message).await?;
        Ok(message)
    }
}

/// Writes a message document with a server-resolved `created_at`. The
/// client-side clock never participates in ordering.
pub(crate) async fn post_message(
    store: &dyn DocumentStore,
    community_id: Uuid,
    message: &ChatMessage,
) -> Result<(), AppError> {
    let mut value = serde_json::to_value(message)?;
    value["created_at"] = server_timestamp();
    store
        .set(&paths::message(community_id, message.id), value)
        .await?;
    Ok(())
}

async fn render_snapshot(
    store: &dyn DocumentStore,
    identity: &IdentityResolver,
    telemetry: &Telemetry,
    snapshot: Vec<Document>,
) -> Vec<RenderedMessage> {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(snapshot.len());
    for doc in &snapshot {
        match doc.decode::<ChatMessage>() {
            Ok(message) => messages.push(message),
            Err(error) => {
                // One malformed document never blocks the rest of the log.
                tracing::warn!(path = %doc.path, error = ?error, "Skipping undecodable message");
            }
        }
    }

    // Server timestamps are the single ordering key; optimistic pending
    // messages (no timestamp yet) sort after everything committed.
    messages.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let mut sender_cache: HashMap<Uuid, UserProfile> = HashMap::new();
    let mut session_cache: HashMap<Uuid, Option<Session>> = HashMap::new();
    let mut rendered = Vec::with_capacity(messages.len());

    for message in messages {
        let sender = match sender_cache.get(&message.sender_id) {
            Some(profile) => profile.clone(),
            None => {
                let profile = identity
                    .resolve_or_fallback(message.sender_id, &message.sender_name)
                    .await;
                sender_cache.insert(message.sender_id, profile.clone());
                profile
            }
        };

        let session_card = match (&message.kind, message.session_ref) {
            (MessageKind::SessionLink { .. }, Some(session_ref)) => {
                let session = match session_cache.get(&session_ref.session_id) {
                    Some(session) => session.clone(),
                    None => {
                        let session =
                            load_session(store, telemetry, session_ref.session_id).await;
                        session_cache.insert(session_ref.session_id, session.clone());
                        session
                    }
                };

                Some(SessionCardState {
                    kind: session_ref.kind,
                    joinable: session.map(|s| s.is_active).unwrap_or(false),
                })
            }
            _ => None,
        };

        rendered.push(RenderedMessage {
            message,
            sender,
            session_card,
        });
    }

    rendered
}

async fn load_session(
    store: &dyn DocumentStore,
    telemetry: &Telemetry,
    session_id: Uuid,
) -> Option<Session> {
    let started = Instant::now();
    let result = store.get(&paths::session(session_id)).await;
    telemetry.observe_store_call("chat.load_session", started.elapsed());

    match result {
        Ok(Some(doc)) => match doc.decode::<Session>() {
            Ok(session) => Some(session),
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = ?error, "Malformed session document");
                None
            }
        },
        Ok(None) => None,
        Err(error) => {
            tracing::warn!(session_id = %session_id, error = ?error, "Session lookup failed for card");
            None
        }
    }
}
