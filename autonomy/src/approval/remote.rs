//! Chat-channel approval: post a request, poll the thread for a yes/no.
//!
//! ```text
//! post_message ──► sleep(poll_interval) ──► fetch_replies ─┬─► decisive reply ─► update_message
//!      │                    ▲                  (fails)      │
//!      │ (fails)            │                     ▼         │
//!      ▼                    └──── no reply ◄── fetch_history
//!   deny(error)                                             └─► deadline passed ─► deny("timeout")
//! ```
//!
//! The deadline is measured on a monotonic clock from the moment the
//! request is posted; the number of poll iterations is irrelevant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::ApprovalBackend;
use super::types::{ApprovalDecision, ApprovalRequest};
use crate::config::RemoteChannelConfig;
use crate::errors::AutonomyError;

const BACKEND_NAME: &str = "remote";

const APPROVE_WORDS: &[&str] = &["approve", "approved", "yes", "y", "ok", "lgtm", "allow"];
const DENY_WORDS: &[&str] = &["deny", "denied", "no", "n", "reject", "rejected"];

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} failed: {error}")]
    Api { method: String, error: String },

    #[error("malformed {method} response: {message}")]
    Malformed { method: String, message: String },
}

/// A message read back from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReply {
    pub message_id: String,
    /// Parent message id when the message was posted in a thread.
    pub thread_id: Option<String>,
    pub author: Option<String>,
    pub text: String,
}

/// Minimal chat API used by [`RemoteChannelBackend`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Post `text` and return the new message's id.
    async fn post_message(&self, channel: &str, text: &str) -> Result<String, ChannelError>;

    /// Replies threaded under `message_id`.
    async fn fetch_replies(
        &self,
        channel: &str,
        message_id: &str,
    ) -> Result<Vec<ChannelReply>, ChannelError>;

    /// Channel messages newer than `since`. Fallback read path; the
    /// backend only trusts entries threaded under its own request.
    async fn fetch_history(&self, channel: &str, since: &str)
        -> Result<Vec<ChannelReply>, ChannelError>;

    async fn update_message(
        &self,
        channel: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError>;
}

/// [`ChannelClient`] for a Slack-style Web API.
pub struct HttpChannelClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpChannelClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn check(method: &str, resp: reqwest::Response) -> Result<Value, ChannelError> {
        let body: Value = resp.json().await?;
        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let error = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            return Err(ChannelError::Api {
                method: method.to_string(),
                error: error.to_string(),
            });
        }
        Ok(body)
    }

    async fn api_post(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .http
            .post(self.url(method))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::check(method, resp).await
    }

    async fn api_get(&self, method: &str, query: &[(&str, &str)]) -> Result<Value, ChannelError> {
        let resp = self
            .http
            .get(self.url(method))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        Self::check(method, resp).await
    }
}

fn parse_messages(method: &str, body: &Value) -> Result<Vec<ChannelReply>, ChannelError> {
    let messages = body
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ChannelError::Malformed {
            method: method.to_string(),
            message: "missing messages array".to_string(),
        })?;

    Ok(messages
        .iter()
        .filter_map(|m| {
            let ts = m.get("ts").and_then(|v| v.as_str())?;
            let author = m
                .get("user")
                .or_else(|| m.get("bot_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let text = m.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Some(ChannelReply {
                message_id: ts.to_string(),
                thread_id: m
                    .get("thread_ts")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                author,
                text: text.to_string(),
            })
        })
        .collect())
}

#[async_trait]
impl ChannelClient for HttpChannelClient {
    async fn post_message(&self, channel: &str, text: &str) -> Result<String, ChannelError> {
        let body = self
            .api_post("chat.postMessage", &json!({ "channel": channel, "text": text }))
            .await?;
        body.get("ts")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ChannelError::Malformed {
                method: "chat.postMessage".to_string(),
                message: "missing ts".to_string(),
            })
    }

    async fn fetch_replies(
        &self,
        channel: &str,
        message_id: &str,
    ) -> Result<Vec<ChannelReply>, ChannelError> {
        let body = self
            .api_get(
                "conversations.replies",
                &[("channel", channel), ("ts", message_id)],
            )
            .await?;
        parse_messages("conversations.replies", &body)
    }

    async fn fetch_history(
        &self,
        channel: &str,
        since: &str,
    ) -> Result<Vec<ChannelReply>, ChannelError> {
        let body = self
            .api_get(
                "conversations.history",
                &[("channel", channel), ("oldest", since)],
            )
            .await?;
        parse_messages("conversations.history", &body)
    }

    async fn update_message(
        &self,
        channel: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.api_post(
            "chat.update",
            &json!({ "channel": channel, "ts": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }
}

/// Interpret a reply's first word as a decision.
pub fn parse_reply(text: &str) -> Option<bool> {
    let word = text
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_lowercase();
    if APPROVE_WORDS.contains(&word.as_str()) {
        Some(true)
    } else if DENY_WORDS.contains(&word.as_str()) {
        Some(false)
    } else {
        None
    }
}

pub struct RemoteChannelBackend {
    client: Arc<dyn ChannelClient>,
    channel: String,
    bot_user_id: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
}

impl RemoteChannelBackend {
    pub fn new(client: Arc<dyn ChannelClient>, config: &RemoteChannelConfig) -> Self {
        Self {
            client,
            channel: config.channel.clone(),
            bot_user_id: config.bot_user_id.clone(),
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    /// Backend talking HTTP to the configured Slack-style API.
    pub fn from_config(config: &RemoteChannelConfig) -> Self {
        let client = HttpChannelClient::new(&config.base_url, &config.token);
        Self::new(Arc::new(client), config)
    }

    async fn poll_once(&self, message_id: &str) -> Result<Vec<ChannelReply>, String> {
        match self.client.fetch_replies(&self.channel, message_id).await {
            Ok(replies) => Ok(replies),
            Err(primary) => {
                warn!(error = %primary, "Reply poll failed, falling back to channel history");
                let history = self
                    .client
                    .fetch_history(&self.channel, message_id)
                    .await
                    .map_err(|fallback| {
                        format!("reply poll failed ({primary}); history fallback failed ({fallback})")
                    })?;
                Ok(history
                    .into_iter()
                    .filter(|m| m.thread_id.as_deref() == Some(message_id))
                    .collect())
            }
        }
    }

    fn decisive(&self, message_id: &str, replies: &[ChannelReply]) -> Option<(bool, ChannelReply)> {
        replies
            .iter()
            .filter(|r| r.message_id != message_id)
            .filter(|r| match (&self.bot_user_id, &r.author) {
                (Some(bot), Some(author)) => bot != author,
                _ => true,
            })
            .find_map(|r| parse_reply(&r.text).map(|approved| (approved, r.clone())))
    }

    fn unavailable(&self, message: impl Into<String>) -> String {
        AutonomyError::BackendUnavailable {
            backend: BACKEND_NAME.to_string(),
            message: message.into(),
        }
        .to_string()
    }

    fn block_on_private(&self, request: &ApprovalRequest) -> ApprovalDecision {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(self.request_approval(request)),
            Err(e) => ApprovalDecision::deny(self.unavailable(e.to_string())),
        }
    }

    async fn finish(&self, message_id: &str, request: &ApprovalRequest, outcome: &str) {
        let text = format!("{}\n\n*{}*", request.describe(), outcome);
        if let Err(e) = self
            .client
            .update_message(&self.channel, message_id, &text)
            .await
        {
            warn!(error = %e, "Failed to update approval message");
        }
    }
}

#[async_trait]
impl ApprovalBackend for RemoteChannelBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    /// Blocks the calling thread until the remote flow finishes.
    ///
    /// On a multi-thread runtime the flow runs on that runtime via
    /// `block_in_place`, from worker and blocking-pool threads alike. A
    /// current-thread runtime cannot drive timers while its caller blocks,
    /// so there the flow gets a private runtime on a scoped thread.
    fn request_approval_sync(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let Ok(handle) = Handle::try_current() else {
            return self.block_on_private(request);
        };
        match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.request_approval(request)))
            }
            _ => {
                debug!(operation = %request.operation, "Running blocking remote approval on a side thread");
                std::thread::scope(|s| {
                    s.spawn(|| self.block_on_private(request))
                        .join()
                        .unwrap_or_else(|_| {
                            ApprovalDecision::deny(self.unavailable("approval thread panicked"))
                        })
                })
            }
        }
    }

    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let message_id = match self
            .client
            .post_message(&self.channel, &request.describe())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(operation = %request.operation, error = %e, "Failed to post approval request");
                return ApprovalDecision::deny(self.unavailable(e.to_string()));
            }
        };
        info!(
            operation = %request.operation,
            message_id = %message_id,
            channel = %self.channel,
            "Approval request posted"
        );

        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;

            let replies = match self.poll_once(&message_id).await {
                Ok(replies) => replies,
                Err(message) => {
                    let reason = self.unavailable(message);
                    warn!(operation = %request.operation, reason = %reason, "Giving up on approval poll");
                    self.finish(&message_id, request, "Denied: approval channel unreachable")
                        .await;
                    return ApprovalDecision::deny(reason);
                }
            };

            if let Some((approved, reply)) = self.decisive(&message_id, &replies) {
                let who = reply.author.clone().unwrap_or_else(|| "unknown".to_string());
                info!(operation = %request.operation, approved, approver = %who, "Remote approval decided");
                let (decision, outcome) = if approved {
                    (ApprovalDecision::approve(format!("approved by {who}")), "Approved")
                } else {
                    (ApprovalDecision::deny(format!("denied by {who}")), "Denied")
                };
                self.finish(&message_id, request, &format!("{outcome} by {who}"))
                    .await;
                return decision
                    .by(who)
                    .with_metadata("message_id", Value::String(message_id));
            }
            debug!(operation = %request.operation, replies = replies.len(), "No decisive reply yet");
        }

        info!(operation = %request.operation, timeout = ?self.timeout, "Remote approval timed out");
        self.finish(&message_id, request, "Expired: no answer before timeout")
            .await;
        ApprovalDecision::deny("timeout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::RiskLevel;

    fn config() -> RemoteChannelConfig {
        RemoteChannelConfig {
            channel: "C1".to_string(),
            bot_user_id: Some("UBOT".to_string()),
            poll_interval_ms: 1_000,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("run_shell", json!({"cmd": "rm -rf build"}), RiskLevel::High)
    }

    fn reply(id: &str, author: &str, text: &str) -> ChannelReply {
        ChannelReply {
            message_id: id.to_string(),
            thread_id: None,
            author: Some(author.to_string()),
            text: text.to_string(),
        }
    }

    fn threaded(id: &str, parent: &str, author: &str, text: &str) -> ChannelReply {
        ChannelReply {
            thread_id: Some(parent.to_string()),
            ..reply(id, author, text)
        }
    }

    fn fast_config() -> RemoteChannelConfig {
        RemoteChannelConfig {
            poll_interval_ms: 10,
            ..config()
        }
    }

    fn answering_client(message_id: &'static str, answer: &'static str) -> MockChannelClient {
        let mut client = MockChannelClient::new();
        client
            .expect_post_message()
            .times(1)
            .returning(move |_, _| Ok(message_id.to_string()));
        client
            .expect_fetch_replies()
            .returning(move |_, _| Ok(vec![reply("9.9", "CAROL", answer)]));
        client.expect_update_message().returning(|_, _, _| Ok(()));
        client
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("Approve"), Some(true));
        assert_eq!(parse_reply("lgtm, go ahead"), Some(true));
        assert_eq!(parse_reply("no!"), Some(false));
        assert_eq!(parse_reply("let me check"), None);
        assert_eq!(parse_reply(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approves_on_human_reply_and_ignores_own_message() {
        let mut client = MockChannelClient::new();
        client
            .expect_post_message()
            .times(1)
            .returning(|_, _| Ok("100.1".to_string()));
        client.expect_fetch_replies().returning(|_, _| {
            Ok(vec![
                reply("100.1", "UBOT", "yes"),
                reply("100.2", "UBOT", "approve"),
                reply("100.3", "ALICE", "approved"),
            ])
        });
        client
            .expect_update_message()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = RemoteChannelBackend::new(Arc::new(client), &config());
        let decision = backend.request_approval(&request()).await;
        assert!(decision.approved);
        assert_eq!(decision.approver.as_deref(), Some("ALICE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_reply() {
        let mut client = MockChannelClient::new();
        client
            .expect_post_message()
            .returning(|_, _| Ok("200.1".to_string()));
        client
            .expect_fetch_replies()
            .returning(|_, _| Ok(vec![reply("200.1", "UBOT", "approve?")]));
        client
            .expect_update_message()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = RemoteChannelBackend::new(Arc::new(client), &config());
        let started = Instant::now();
        let decision = backend.request_approval(&request()).await;
        assert!(!decision.approved);
        assert!(decision.reason.contains("timeout"));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_history() {
        let mut client = MockChannelClient::new();
        client
            .expect_post_message()
            .returning(|_, _| Ok("300.1".to_string()));
        client.expect_fetch_replies().returning(|_, _| {
            Err(ChannelError::Api {
                method: "conversations.replies".to_string(),
                error: "ratelimited".to_string(),
            })
        });
        client
            .expect_fetch_history()
            .times(1)
            .returning(|_, _| Ok(vec![threaded("300.2", "300.1", "BOB", "deny")]));
        client.expect_update_message().returning(|_, _, _| Ok(()));

        let backend = RemoteChannelBackend::new(Arc::new(client), &config());
        let decision = backend.request_approval(&request()).await;
        assert!(!decision.approved);
        assert_eq!(decision.approver.as_deref(), Some("BOB"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denies_when_both_reads_fail() {
        let mut client = MockChannelClient::new();
        client
            .expect_post_message()
            .returning(|_, _| Ok("400.1".to_string()));
        client.expect_fetch_replies().returning(|_, _| {
            Err(ChannelError::Api {
                method: "conversations.replies".to_string(),
                error: "channel_not_found".to_string(),
            })
        });
        client.expect_fetch_history().returning(|_, _| {
            Err(ChannelError::Api {
                method: "conversations.history".to_string(),
                error: "channel_not_found".to_string(),
            })
        });
        client.expect_update_message().returning(|_, _, _| Ok(()));

        let backend = RemoteChannelBackend::new(Arc::new(client), &config());
        let decision = backend.request_approval(&request()).await;
        assert!(!decision.approved);
        assert!(decision.reason.contains("channel_not_found"));
    }

    #[tokio::test]
    async fn test_post_failure_denies_immediately() {
        let mut client = MockChannelClient::new();
        client.expect_post_message().returning(|_, _| {
            Err(ChannelError::Api {
                method: "chat.postMessage".to_string(),
                error: "not_in_channel".to_string(),
            })
        });
        client.expect_fetch_replies().never();
        client.expect_update_message().never();

        let backend = RemoteChannelBackend::new(Arc::new(client), &config());
        let decision = backend.request_approval(&request()).await;
        assert!(!decision.approved);
        assert!(decision.reason.contains("not_in_channel"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_fallback_ignores_unthreaded_chatter() {
        let mut client = MockChannelClient::new();
        client
            .expect_post_message()
            .returning(|_, _| Ok("350.1".to_string()));
        client.expect_fetch_replies().returning(|_, _| {
            Err(ChannelError::Api {
                method: "conversations.replies".to_string(),
                error: "ratelimited".to_string(),
            })
        });
        client.expect_fetch_history().returning(|_, _| {
            Ok(vec![
                reply("350.2", "DAVE", "ok, lunch?"),
                threaded("350.3", "349.0", "ERIN", "yes"),
            ])
        });
        client
            .expect_update_message()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let request = ApprovalRequest::new("git_reset", json!({"to": "HEAD~5"}), RiskLevel::Critical);
        let backend = RemoteChannelBackend::new(Arc::new(client), &config());
        let decision = backend.request_approval(&request).await;
        assert!(!decision.approved);
        assert_eq!(decision.reason, "timeout");
    }

    #[test]
    fn test_parse_messages_keeps_thread_parent() {
        let body = json!({
            "ok": true,
            "messages": [
                {"ts": "1.0", "user": "UBOT", "text": "approve?"},
                {"ts": "1.1", "thread_ts": "1.0", "user": "ALICE", "text": "yes"},
            ]
        });
        let messages = parse_messages("conversations.replies", &body).unwrap();
        assert_eq!(messages[0].thread_id, None);
        assert_eq!(messages[1].thread_id.as_deref(), Some("1.0"));
        assert_eq!(messages[1].author.as_deref(), Some("ALICE"));
    }

    #[tokio::test]
    async fn test_sync_variant_on_current_thread_runtime() {
        let backend = RemoteChannelBackend::new(Arc::new(answering_client("500.1", "yes")), &fast_config());
        let decision = backend.request_approval_sync(&request());
        assert!(decision.approved);
        assert_eq!(decision.approver.as_deref(), Some("CAROL"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_variant_on_multi_thread_runtime() {
        let backend = RemoteChannelBackend::new(Arc::new(answering_client("510.1", "no")), &fast_config());
        let decision = backend.request_approval_sync(&request());
        assert!(!decision.approved);
        assert_eq!(decision.approver.as_deref(), Some("CAROL"));
    }

    #[test]
    fn test_sync_variant_outside_runtime() {
        let backend = RemoteChannelBackend::new(Arc::new(answering_client("520.1", "yes")), &fast_config());
        let decision = backend.request_approval_sync(&request());
        assert!(decision.approved);
    }

    async fn run_blocking_executor_against_remote() {
        use crate::approval::ApprovalRegistry;
        use crate::escalation::{BlockingExecutor, EscalationPipeline, Stage};

        let backend = Arc::new(RemoteChannelBackend::new(
            Arc::new(answering_client("600.1", "yes")),
            &fast_config(),
        ));
        let registry = Arc::new(ApprovalRegistry::with_defaults(backend));
        let exec = BlockingExecutor::new(move |_request: &str, _stage: Stage| {
            let decision = registry.approve_sync(None, "run_shell", json!({"cmd": "make"}));
            if !decision.approved {
                anyhow::bail!("denied: {}", decision.reason);
            }
            Ok("built".to_string())
        });
        let result = EscalationPipeline::with_defaults(Arc::new(exec))
            .run("What is the capital of France?", &Default::default())
            .await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.response.as_deref(), Some("built"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_executor_uses_remote_backend_multi_thread() {
        run_blocking_executor_against_remote().await;
    }

    #[tokio::test]
    async fn test_blocking_executor_uses_remote_backend_current_thread() {
        run_blocking_executor_against_remote().await;
    }
}
