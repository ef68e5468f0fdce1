use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{CallId, ConversationId, DeclineReason, EndReason, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CallActionRequest, CallRecord, DeclineCallRequest, EndCallRequest, InitiateCallRequest,
        LoginRequest, LoginResponse, MediaTokenRequest, MediaTokenResponse, OnlineUsersResponse,
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("server rejected request ({:?}): {}", .0.code, .0.message)]
    Rejected(ApiError),
    #[error("request failed: {0}")]
    Transport(String),
}

impl OrchestratorError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            OrchestratorError::Rejected(error) => Some(error.code),
            OrchestratorError::Transport(_) => None,
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(value: reqwest::Error) -> Self {
        OrchestratorError::Transport(value.to_string())
    }
}

/// REST side of a call, as seen by the controller.
#[async_trait]
pub trait CallOrchestrator: Send + Sync {
    async fn media_token(
        &self,
        user_id: UserId,
        channel_name: &str,
        call_id: Option<CallId>,
    ) -> Result<MediaTokenResponse, OrchestratorError>;
    async fn initiate(&self, request: &InitiateCallRequest)
        -> Result<CallRecord, OrchestratorError>;
    async fn answer(&self, user_id: UserId, call_id: CallId)
        -> Result<CallRecord, OrchestratorError>;
    async fn decline(
        &self,
        user_id: UserId,
        call_id: CallId,
        reason: DeclineReason,
    ) -> Result<CallRecord, OrchestratorError>;
    async fn end(
        &self,
        user_id: UserId,
        call_id: CallId,
        reason: EndReason,
    ) -> Result<CallRecord, OrchestratorError>;
    async fn leave(&self, user_id: UserId, call_id: CallId)
        -> Result<CallRecord, OrchestratorError>;
}

pub struct MissingCallOrchestrator;

fn unavailable<T>() -> Result<T, OrchestratorError> {
    Err(OrchestratorError::Transport(
        "call orchestrator is unavailable".to_string(),
    ))
}

#[async_trait]
impl CallOrchestrator for MissingCallOrchestrator {
    async fn media_token(
        &self,
        _user_id: UserId,
        _channel_name: &str,
        _call_id: Option<CallId>,
    ) -> Result<MediaTokenResponse, OrchestratorError> {
        unavailable()
    }

    async fn initiate(
        &self,
        _request: &InitiateCallRequest,
    ) -> Result<CallRecord, OrchestratorError> {
        unavailable()
    }

    async fn answer(
        &self,
        _user_id: UserId,
        _call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        unavailable()
    }

    async fn decline(
        &self,
        _user_id: UserId,
        _call_id: CallId,
        _reason: DeclineReason,
    ) -> Result<CallRecord, OrchestratorError> {
        unavailable()
    }

    async fn end(
        &self,
        _user_id: UserId,
        _call_id: CallId,
        _reason: EndReason,
    ) -> Result<CallRecord, OrchestratorError> {
        unavailable()
    }

    async fn leave(
        &self,
        _user_id: UserId,
        _call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        unavailable()
    }
}

/// Talks to the server's REST routes.
#[derive(Clone)]
pub struct HttpCallOrchestrator {
    http: Client,
    server_url: String,
}

impl HttpCallOrchestrator {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn login(&self, username: &str) -> Result<UserId, OrchestratorError> {
        let body: LoginResponse = self
            .post_json(
                "/login",
                &LoginRequest {
                    username: username.to_string(),
                },
            )
            .await?;
        Ok(UserId(body.user_id))
    }

    pub async fn get_call(
        &self,
        user_id: UserId,
        call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        let res = self
            .http
            .get(format!("{}/calls/{}", self.server_url, call_id.0))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        decode(res).await
    }

    pub async fn history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<CallId>,
    ) -> Result<Vec<CallRecord>, OrchestratorError> {
        let mut query = vec![
            ("user_id", user_id.0.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.0.to_string()));
        }
        let res = self
            .http
            .get(format!(
                "{}/conversations/{}/calls",
                self.server_url, conversation_id.0
            ))
            .query(&query)
            .send()
            .await?;
        decode(res).await
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, OrchestratorError> {
        let res = self
            .http
            .get(format!("{}/presence/online", self.server_url))
            .send()
            .await?;
        let body: OnlineUsersResponse = decode(res).await?;
        Ok(body.user_ids)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, OrchestratorError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let res = self
            .http
            .post(format!("{}{}", self.server_url, path))
            .json(body)
            .send()
            .await?;
        decode(res).await
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, OrchestratorError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json().await?);
    }
    let bytes = res.bytes().await?;
    let error = serde_json::from_slice::<ApiError>(&bytes).unwrap_or_else(|_| {
        ApiError::new(ErrorCode::Internal, format!("unexpected status {status}"))
    });
    Err(OrchestratorError::Rejected(error))
}

#[async_trait]
impl CallOrchestrator for HttpCallOrchestrator {
    async fn media_token(
        &self,
        user_id: UserId,
        channel_name: &str,
        call_id: Option<CallId>,
    ) -> Result<MediaTokenResponse, OrchestratorError> {
        self.post_json(
            "/token",
            &MediaTokenRequest {
                user_id,
                channel_name: channel_name.to_string(),
                call_id,
            },
        )
        .await
    }

    async fn initiate(
        &self,
        request: &InitiateCallRequest,
    ) -> Result<CallRecord, OrchestratorError> {
        self.post_json("/calls/initiate", request).await
    }

    async fn answer(
        &self,
        user_id: UserId,
        call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        self.post_json(
            &format!("/calls/{}/answer", call_id.0),
            &CallActionRequest { user_id },
        )
        .await
    }

    async fn decline(
        &self,
        user_id: UserId,
        call_id: CallId,
        reason: DeclineReason,
    ) -> Result<CallRecord, OrchestratorError> {
        self.post_json(
            &format!("/calls/{}/decline", call_id.0),
            &DeclineCallRequest { user_id, reason },
        )
        .await
    }

    async fn end(
        &self,
        user_id: UserId,
        call_id: CallId,
        reason: EndReason,
    ) -> Result<CallRecord, OrchestratorError> {
        self.post_json(
            &format!("/calls/{}/end", call_id.0),
            &EndCallRequest { user_id, reason },
        )
        .await
    }

    async fn leave(
        &self,
        user_id: UserId,
        call_id: CallId,
    ) -> Result<CallRecord, OrchestratorError> {
        self.post_json(
            &format!("/calls/{}/leave", call_id.0),
            &EndCallRequest {
                user_id,
                reason: EndReason::Hangup,
            },
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
