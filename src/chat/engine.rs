use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::db::models::{AttachmentRef, ChatMessage, NewMessage};
use crate::error::{AppError, Result};

use super::backend::{ChatBackend, StreamRequest};
use super::registry::TEMP_STREAM_ID;
use super::session::{promote, Promotion, Session};
use super::stream::{StreamEvent, TokenEvent, TurnAccumulator};

/// Notifications for views that follow the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A durable session was created; `replaced` names the session it
    /// stands in for, if any.
    SessionCreated {
        session_id: String,
        replaced: Option<String>,
    },
    /// A token of the reply being streamed.
    Token(String),
}

/// How a turn ended. Every variant carries the one assistant message that
/// was persisted for it.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(ChatMessage),
    Cancelled(ChatMessage),
    Failed(ChatMessage),
}

impl TurnOutcome {
    pub fn message(&self) -> &ChatMessage {
        match self {
            TurnOutcome::Completed(m) | TurnOutcome::Cancelled(m) | TurnOutcome::Failed(m) => m,
        }
    }
}

#[derive(Debug, Default)]
struct TurnState {
    stream_key: Option<String>,
    stop_requested: bool,
}

/// Clears the turn state when the turn ends, however it ends.
struct TurnGuard {
    state: Arc<Mutex<TurnState>>,
}

impl TurnGuard {
    fn begin(state: &Arc<Mutex<TurnState>>, stream_key: &str) -> Result<Self> {
        let mut turn = state.lock().map_err(|_| AppError::LockPoisoned("turn state"))?;
        if let Some(current) = &turn.stream_key {
            return Err(AppError::Busy(current.clone()));
        }
        turn.stream_key = Some(stream_key.to_string());
        turn.stop_requested = false;
        Ok(Self {
            state: state.clone(),
        })
    }

    fn set_stream_key(&self, key: &str) {
        if let Ok(mut turn) = self.state.lock() {
            turn.stream_key = Some(key.to_string());
        }
    }

    fn take_stop_request(&self) -> bool {
        self.state
            .lock()
            .map(|mut turn| std::mem::take(&mut turn.stop_requested))
            .unwrap_or(false)
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut turn) = self.state.lock() {
            *turn = TurnState::default();
        }
    }
}

/// Stops the engine's current turn from another task.
pub struct StopHandle<B: ?Sized> {
    backend: Arc<B>,
    state: Arc<Mutex<TurnState>>,
}

impl<B: ?Sized> Clone for StopHandle<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            state: self.state.clone(),
        }
    }
}

impl<B: ChatBackend + ?Sized> StopHandle<B> {
    /// Request cancellation. The turn still ends through its own terminal
    /// event. A stop that arrives before the stream has started is applied
    /// as soon as it starts.
    pub async fn stop(&self) -> Result<()> {
        let key = {
            let mut turn = self
                .state
                .lock()
                .map_err(|_| AppError::LockPoisoned("turn state"))?;
            let key = turn
                .stream_key
                .clone()
                .ok_or_else(|| AppError::NoActiveStream(TEMP_STREAM_ID.to_string()))?;
            turn.stop_requested = true;
            key
        };
        match self.backend.stop_chat_streaming(&key).await {
            Err(AppError::NoActiveStream(_)) => {
                tracing::debug!(stream = %key, "Stop deferred until the stream starts");
                Ok(())
            }
            other => other,
        }
    }
}

/// Drives conversations against a [`ChatBackend`]: resolves the session,
/// persists the user message, consumes the stream and persists exactly one
/// assistant message per turn.
pub struct ChatEngine<B: ?Sized> {
    backend: Arc<B>,
    config: AppConfig,
    session: Session,
    transcript: Vec<ChatMessage>,
    turn: Arc<Mutex<TurnState>>,
    events: broadcast::Sender<EngineEvent>,
}

impl<B: ChatBackend + ?Sized> ChatEngine<B> {
    pub fn new(backend: Arc<B>, config: AppConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backend,
            config,
            session: Session::draft(None),
            transcript: Vec::new(),
            turn: Arc::new(Mutex::new(TurnState::default())),
            events,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Messages of the current session as persisted, oldest first.
    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle<B> {
        StopHandle {
            backend: self.backend.clone(),
            state: self.turn.clone(),
        }
    }

    pub fn set_config(&mut self, config: AppConfig) {
        self.config = config;
    }

    pub fn is_streaming(&self) -> bool {
        self.turn
            .lock()
            .map(|t| t.stream_key.is_some())
            .unwrap_or(false)
    }

    /// Start a new, not yet persisted conversation.
    pub fn new_draft(&mut self, model_id: Option<String>) {
        self.session = Session::draft(model_id);
        self.transcript.clear();
    }

    /// Switch to a persisted session. Any draft is discarded.
    pub async fn select_session(&mut self, session_id: &str) -> Result<()> {
        let session = self
            .backend
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        let messages = self.backend.get_session_messages(session_id).await?;
        self.session = Session::Persisted(session);
        self.transcript = messages;
        Ok(())
    }

    /// Record a message without a model turn. Drafts keep it until they are
    /// promoted.
    pub async fn append(&mut self, message: NewMessage) -> Result<()> {
        match &mut self.session {
            Session::Draft(draft) => {
                draft.messages.push(message);
                Ok(())
            }
            Session::Persisted(session) => {
                let stored = self
                    .backend
                    .add_message_to_session(&session.id, message)
                    .await?;
                self.transcript.push(stored);
                Ok(())
            }
        }
    }

    pub async fn send(&mut self, text: &str, attachments: Vec<AttachmentRef>) -> Result<TurnOutcome> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(AppError::InvalidInput("message is empty".into()));
        }
        let guard = TurnGuard::begin(&self.turn, self.session.stream_key())?;

        let before = self.session.clone();
        let (session, promotion) = promote(&mut self.session, self.backend.as_ref()).await?;
        let mut created_for_turn = false;
        match promotion {
            Promotion::Existing => {}
            Promotion::Created { flushed } => {
                tracing::debug!(session_id = %session.id, flushed, "Session created for turn");
                self.transcript = self.backend.get_session_messages(&session.id).await?;
                created_for_turn = self.transcript.is_empty();
                self.notify(EngineEvent::SessionCreated {
                    session_id: session.id.clone(),
                    replaced: None,
                });
            }
            Promotion::Replaced { previous_id } => {
                self.notify(EngineEvent::SessionCreated {
                    session_id: session.id.clone(),
                    replaced: Some(previous_id),
                });
            }
        }
        guard.set_stream_key(&session.id);

        let user_message = NewMessage::user(text, attachments.clone());
        let user = match self
            .backend
            .add_message_to_session(&session.id, user_message.clone())
            .await
        {
            Ok(user) => user,
            Err(e) => {
                if created_for_turn {
                    self.abandon_session(&session.id, before).await;
                }
                return Err(e);
            }
        };
        self.transcript.push(user.clone());

        let mut request = StreamRequest::from_config(&self.config, Some(session.id.clone()), text);
        if let Some(model_id) = &session.model_id {
            request.model_name = model_id.clone();
        }
        request.attachments = attachments;
        let mut stream = match self.backend.stream_chat_completion(request).await {
            Ok(stream) => stream,
            Err(e) => {
                if created_for_turn {
                    self.abandon_session(&session.id, before).await;
                } else {
                    self.abandon_message(&session.id, &user.id).await;
                }
                return Err(e);
            }
        };

        if guard.take_stop_request() {
            if let Err(e) = self.backend.stop_chat_streaming(&session.id).await {
                tracing::debug!(session_id = %session.id, error = %e, "Deferred stop not applied");
            }
        }

        let mut acc = TurnAccumulator::new();
        let outcome = loop {
            match stream.recv().await {
                Some(StreamEvent::ChatToken(TokenEvent {
                    token,
                    finished: false,
                    ..
                })) => {
                    acc.push_token(&token);
                    self.notify(EngineEvent::Token(token));
                }
                Some(StreamEvent::ChatToken(TokenEvent {
                    cancelled, usage, ..
                })) => {
                    if let Some(usage) = usage {
                        acc.set_usage(usage);
                    }
                    let cancelled = cancelled.unwrap_or(false);
                    let reply = acc.finalize(cancelled);
                    let stored = self
                        .persist(&session.id, (user.id.as_str(), &user_message), reply)
                        .await?;
                    break if cancelled {
                        TurnOutcome::Cancelled(stored)
                    } else {
                        TurnOutcome::Completed(stored)
                    };
                }
                Some(StreamEvent::ChatUsage(usage)) => acc.set_usage(usage),
                Some(StreamEvent::ToolCall(call)) => acc.buffer_tool_call(call),
                Some(StreamEvent::ChatError(e)) => {
                    acc.clear();
                    let error = NewMessage::error(format!("Error: {}", e.error));
                    let stored = self
                        .persist(&session.id, (user.id.as_str(), &user_message), error)
                        .await?;
                    break TurnOutcome::Failed(stored);
                }
                None => {
                    acc.clear();
                    let error = NewMessage::error("Error: the response stream ended unexpectedly");
                    let stored = self
                        .persist(&session.id, (user.id.as_str(), &user_message), error)
                        .await?;
                    break TurnOutcome::Failed(stored);
                }
            }
        };
        drop(guard);
        Ok(outcome)
    }

    /// Store the turn's assistant message. If the session was deleted while
    /// the reply streamed, a replacement is created and receives the user
    /// message again, then the reply.
    async fn persist(
        &mut self,
        session_id: &str,
        (user_id, user_message): (&str, &NewMessage),
        message: NewMessage,
    ) -> Result<ChatMessage> {
        match self
            .backend
            .add_message_to_session(session_id, message.clone())
            .await
        {
            Ok(stored) => {
                self.transcript.push(stored.clone());
                Ok(stored)
            }
            Err(AppError::SessionNotFound(_)) => {
                let (replacement, promotion) = promote(&mut self.session, self.backend.as_ref()).await?;
                if let Promotion::Replaced { previous_id } = promotion {
                    tracing::warn!(
                        session_id = %replacement.id,
                        previous = %previous_id,
                        "Session deleted during the turn, reply moved to a replacement"
                    );
                    self.notify(EngineEvent::SessionCreated {
                        session_id: replacement.id.clone(),
                        replaced: Some(previous_id),
                    });
                    let user = self
                        .backend
                        .add_message_to_session(&replacement.id, user_message.clone())
                        .await?;
                    self.transcript.retain(|m| m.id != user_id);
                    self.transcript.push(user);
                }
                let stored = self
                    .backend
                    .add_message_to_session(&replacement.id, message)
                    .await?;
                self.transcript.push(stored.clone());
                Ok(stored)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a session that was created for a turn that never started, and
    /// go back to the draft it came from.
    async fn abandon_session(&mut self, session_id: &str, draft: Session) {
        if let Err(e) = self.backend.delete_chat_session(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Could not remove session of failed turn");
        }
        self.session = draft;
        self.transcript.clear();
    }

    async fn abandon_message(&mut self, session_id: &str, message_id: &str) {
        if let Err(e) = self.backend.delete_message(session_id, message_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Could not remove message of failed turn");
        }
        self.transcript.retain(|m| m.id != message_id);
    }

    fn notify(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}
