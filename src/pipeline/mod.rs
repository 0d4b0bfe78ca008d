//! Turn orchestration: snapshot history, ask the backend, record the exchange.
//!
//! A turn only ever mutates the session after the backend succeeded. Every
//! failure, including a panic anywhere inside the turn, becomes a fixed
//! user-facing message and leaves history exactly as it was.

pub mod gate;

pub use gate::{TurnGate, TurnGuard, TurnTicket};

use crate::channels::Channel;
use crate::config::Config;
use crate::providers::{ChatMessage, GenerationOptions, Provider, ProviderErrorKind};
use crate::sessions::{SessionStore, Turn};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Shown when the backend call fails, whatever the failure class.
pub const BACKEND_FAILURE_REPLY: &str =
    "Error: Unable to process request. Insufficient data or API error.";

/// Shown when the turn itself faults.
pub const SYSTEM_FAULT_REPLY: &str =
    "System error: Unable to process your request. Please try again or contact administrator.";

/// Result of one turn, as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Generated text, already recorded in the session.
    Reply(String),
    /// The backend failed; history untouched.
    BackendFailure(ProviderErrorKind),
    /// Internal fault caught at the pipeline boundary; history untouched.
    SystemFault,
}

impl TurnOutcome {
    /// Text to deliver to the user.
    pub fn text(&self) -> &str {
        match self {
            Self::Reply(text) => text,
            Self::BackendFailure(_) => BACKEND_FAILURE_REPLY,
            Self::SystemFault => SYSTEM_FAULT_REPLY,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply(_))
    }
}

/// Where to show the "working" indicator while a turn waits on the backend.
#[derive(Clone)]
pub struct PendingSignal {
    pub channel: Arc<dyn Channel>,
    pub recipient: String,
}

impl PendingSignal {
    pub fn new(channel: Arc<dyn Channel>, recipient: impl Into<String>) -> Self {
        Self {
            channel,
            recipient: recipient.into(),
        }
    }

    /// Fire and forget; the turn never waits on it.
    fn emit(&self) {
        let channel = Arc::clone(&self.channel);
        let recipient = self.recipient.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.start_typing(&recipient).await {
                tracing::debug!(channel = channel.name(), "typing indicator failed: {e}");
            }
        });
    }
}

/// A place in line for one user's turn. Obtained synchronously from
/// [`MessagePipeline::reserve`] so arrival order is fixed before any await.
pub struct TurnSlot {
    user_id: String,
    ticket: Option<TurnTicket>,
}

impl TurnSlot {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Wait until every earlier turn for this user has finished.
    pub async fn acquire(self) -> ActiveTurn {
        let guard = match self.ticket {
            Some(ticket) => Some(ticket.wait().await),
            None => None,
        };
        ActiveTurn {
            user_id: self.user_id,
            _guard: guard,
        }
    }
}

/// Exclusive access to one user's conversation; later turns wait until it drops.
pub struct ActiveTurn {
    user_id: String,
    _guard: Option<TurnGuard>,
}

impl ActiveTurn {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

pub struct MessagePipeline {
    sessions: Arc<dyn SessionStore>,
    provider: Arc<dyn Provider>,
    system_prompt: Arc<str>,
    options: GenerationOptions,
    gate: Option<TurnGate>,
}

impl MessagePipeline {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        provider: Arc<dyn Provider>,
        system_prompt: impl Into<Arc<str>>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            sessions,
            provider,
            system_prompt: system_prompt.into(),
            options,
            gate: Some(TurnGate::new()),
        }
    }

    /// Process one user's messages one at a time in arrival order (the default),
    /// or let them run concurrently.
    pub fn serialize_user_turns(mut self, enabled: bool) -> Self {
        self.gate = enabled.then(TurnGate::new);
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    pub fn reserve(&self, user_id: &str) -> TurnSlot {
        TurnSlot {
            user_id: user_id.to_string(),
            ticket: self.gate.as_ref().map(|gate| gate.enter(user_id)),
        }
    }

    /// Handle free text from `user_id` and return what to send back.
    pub async fn handle_message(&self, user_id: &str, text: &str) -> TurnOutcome {
        let slot = self.reserve(user_id);
        self.handle_reserved(slot, text, None).await
    }

    /// Run a previously reserved turn, signalling `pending` before the backend call.
    pub async fn handle_reserved(
        &self,
        slot: TurnSlot,
        text: &str,
        pending: Option<PendingSignal>,
    ) -> TurnOutcome {
        let turn = slot.acquire().await;
        self.handle_active(&turn, text, pending.as_ref()).await
    }

    /// Run a turn the caller already holds. Never panics and never returns an error:
    /// every fault is logged and mapped to a [`TurnOutcome`].
    pub async fn handle_active(
        &self,
        turn: &ActiveTurn,
        text: &str,
        pending: Option<&PendingSignal>,
    ) -> TurnOutcome {
        let user_id = turn.user_id();
        match AssertUnwindSafe(self.run_turn(user_id, text, pending))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                tracing::error!(user_id = %user_id, panic = %detail, "Turn panicked; history left unchanged");
                TurnOutcome::SystemFault
            }
        }
    }

    async fn run_turn(
        &self,
        user_id: &str,
        text: &str,
        pending: Option<&PendingSignal>,
    ) -> TurnOutcome {
        let history = self.sessions.snapshot(user_id).await;
        let request = build_request(&self.system_prompt, &history, text);

        if let Some(pending) = pending {
            pending.emit();
        }

        tracing::debug!(
            user_id = %user_id,
            history_turns = history.len(),
            messages = request.len(),
            "Sending turn to backend"
        );

        match self.provider.generate(&request, &self.options).await {
            Ok(reply) => {
                self.sessions.append_exchange(user_id, text, &reply).await;
                tracing::info!(
                    user_id = %user_id,
                    turns = (history.len() + 2).min(self.sessions.max_turns()),
                    reply_chars = reply.chars().count(),
                    "Turn completed"
                );
                TurnOutcome::Reply(reply)
            }
            Err(err) => {
                let kind = err.kind();
                match kind {
                    ProviderErrorKind::Authentication => tracing::error!(
                        user_id = %user_id,
                        provider = self.provider.name(),
                        error_kind = %kind,
                        error = %err,
                        "Backend rejected credentials; no user can be served until the API key is fixed"
                    ),
                    ProviderErrorKind::Transient => tracing::warn!(
                        user_id = %user_id,
                        provider = self.provider.name(),
                        error_kind = %kind,
                        error = %err,
                        "Backend call failed"
                    ),
                    ProviderErrorKind::Unknown => tracing::error!(
                        user_id = %user_id,
                        provider = self.provider.name(),
                        error_kind = %kind,
                        error = ?err,
                        "Backend call failed"
                    ),
                }
                TurnOutcome::BackendFailure(kind)
            }
        }
    }
}

/// Factory: the pipeline described by config, with its backend and session store.
pub async fn create_pipeline(config: &Config) -> anyhow::Result<MessagePipeline> {
    let provider = crate::providers::create_provider(config)?;
    let sessions = crate::sessions::create_session_store(&config.session);
    let system_prompt = config.system_prompt().await?;

    tracing::info!(
        provider = provider.name(),
        model = %config.model,
        max_turns = sessions.max_turns(),
        serialize_user_turns = config.pipeline.serialize_user_turns,
        "Message pipeline ready"
    );

    Ok(
        MessagePipeline::new(sessions, provider, system_prompt, config.generation_options())
            .serialize_user_turns(config.pipeline.serialize_user_turns),
    )
}

/// `[system] ++ history ++ [user]`: always `history.len() + 2` messages.
pub fn build_request(system_prompt: &str, history: &[Turn], user_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::user(user_text));
    messages
}
