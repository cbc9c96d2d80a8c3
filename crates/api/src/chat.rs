//! Chat orchestration
//!
//! Provision, admit, forward upstream, meter, and save the turn when the
//! request names a session. The guard runs before the upstream call so a
//! denied request never spends upstream capacity.

use std::sync::Arc;

use chatmeter_billing::{
    Admission, EntitlementGuard, SubscriptionService, UsageMeter, UsageReport, DEFAULT_MODEL,
};
use chatmeter_shared::{SubscriptionTier, VerifiedIdentity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::history::{ChatHistory, ChatSession, NewMessage, StoredMessage};
use crate::upstream::{ChatMessage, CompletionClient, CompletionRequest, Role, TokenUsage};

pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Inbound chat request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Save the turn to this session
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    fn validate(&self) -> ApiResult<()> {
        if self.messages.is_empty() {
            return Err(ApiError::Validation(
                "At least one message is required".to_string(),
            ));
        }
        if self.messages.iter().all(|m| m.content.trim().is_empty()) {
            return Err(ApiError::Validation("Messages must not be empty".to_string()));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ApiError::Validation(
                    "temperature must be between 0 and 2".to_string(),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ApiError::Validation(
                "max_tokens must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn model(&self) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
            .to_string()
    }
}

/// Completed chat turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub model: String,
    pub usage: TokenUsage,
    pub tier: SubscriptionTier,
    /// Set when the turn was saved
    pub session_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct ChatService {
    subscriptions: SubscriptionService,
    guard: EntitlementGuard,
    meter: UsageMeter,
    history: ChatHistory,
    upstream: Arc<dyn CompletionClient>,
}

impl ChatService {
    pub fn new(
        subscriptions: SubscriptionService,
        guard: EntitlementGuard,
        meter: UsageMeter,
        history: ChatHistory,
        upstream: Arc<dyn CompletionClient>,
    ) -> Self {
        Self {
            subscriptions,
            guard,
            meter,
            history,
            upstream,
        }
    }

    pub async fn complete(
        &self,
        claims: &VerifiedIdentity,
        request: ChatRequest,
    ) -> ApiResult<ChatResponse> {
        request.validate()?;

        // A store outage here still lets the resolver fall back to free
        if let Err(e) = self.subscriptions.provision_user(claims).await {
            tracing::warn!(identity = %claims.subject, error = %e, "failed to provision user");
        }

        let model = request.model();
        let snapshot = match self.guard.admit(&claims.subject, &model).await {
            Admission::Granted(snapshot) => snapshot,
            Admission::Denied { denial, .. } => return Err(denial.into()),
        };

        let session = match (request.session_id, snapshot.user_id) {
            (Some(session_id), Some(user_id)) => {
                self.history.session(user_id, session_id).await?;
                Some((user_id, session_id))
            }
            (Some(session_id), None) => {
                tracing::warn!(identity = %claims.subject, session_id = %session_id, "no profile; turn will not be saved");
                None
            }
            (None, _) => None,
        };
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(NewMessage::from_chat);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = request.system_prompt.as_deref().map(str::trim) {
            if !prompt.is_empty() {
                messages.push(ChatMessage::system(prompt));
            }
        }
        messages.extend(request.messages);

        let completion = self
            .upstream
            .complete(&CompletionRequest {
                model,
                messages,
                max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            })
            .await?;

        let tokens = completion.usage.total_tokens.max(0);
        match snapshot.user_id {
            Some(user_id) => self.meter.record_usage_for(user_id, 1, tokens).await,
            None => self.meter.record_usage(&claims.subject, 1, tokens).await,
        }

        tracing::debug!(
            identity = %claims.subject,
            model = %completion.model,
            tokens,
            "chat completion served"
        );

        let mut saved_to = None;
        if let Some((user_id, session_id)) = session {
            let mut turn: Vec<NewMessage> = prompt.into_iter().collect();
            turn.push(NewMessage {
                role: Role::Assistant,
                content: completion.content.clone(),
                model_used: Some(completion.model.clone()),
                tokens_used: tokens,
            });
            if self.history.record_turn(user_id, session_id, &turn).await {
                saved_to = Some(session_id);
            }
        }

        Ok(ChatResponse {
            message: completion.content,
            model: completion.model,
            usage: completion.usage,
            tier: snapshot.tier,
            session_id: saved_to,
        })
    }

    async fn owner_id(&self, claims: &VerifiedIdentity) -> ApiResult<Uuid> {
        Ok(self.subscriptions.provision_user(claims).await?.user_id)
    }

    pub async fn create_session(
        &self,
        claims: &VerifiedIdentity,
        title: Option<&str>,
    ) -> ApiResult<ChatSession> {
        let user_id = self.owner_id(claims).await?;
        self.history.create_session(user_id, title).await
    }

    pub async fn list_sessions(&self, claims: &VerifiedIdentity) -> ApiResult<Vec<ChatSession>> {
        let user_id = self.owner_id(claims).await?;
        self.history.list_sessions(user_id).await
    }

    pub async fn rename_session(
        &self,
        claims: &VerifiedIdentity,
        session_id: Uuid,
        title: &str,
    ) -> ApiResult<ChatSession> {
        let user_id = self.owner_id(claims).await?;
        self.history.rename_session(user_id, session_id, title).await
    }

    pub async fn delete_session(&self, claims: &VerifiedIdentity, session_id: Uuid) -> ApiResult<()> {
        let user_id = self.owner_id(claims).await?;
        self.history.delete_session(user_id, session_id).await
    }

    pub async fn session_messages(
        &self,
        claims: &VerifiedIdentity,
        session_id: Uuid,
    ) -> ApiResult<Vec<StoredMessage>> {
        let user_id = self.owner_id(claims).await?;
        self.history.messages(user_id, session_id).await
    }

    /// Current usage and limits for the caller
    pub async fn usage(&self, claims: &VerifiedIdentity) -> UsageReport {
        let snapshot = self.guard.resolver().resolve(&claims.subject).await;
        UsageReport::from_snapshot(&snapshot)
    }
}
