use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use porthole_core::{
    Backoff, BackoffConfig, Bastion, BastionSession, Classify, Endpoint, SessionState,
};
use porthole_cloud::{CloudApi, CloudError, CreateSessionRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Result, SessionError};

/// Overall ceiling for `open`: create plus polling to ACTIVE.
const OPEN_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the watcher re-reads the session looking for early failure.
const DEFAULT_WATCH_POLL: Duration = Duration::from_secs(60);

/// Lifecycle notifications delivered by [`SessionManager::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The refresh window opened; prepare a replacement now.
    RefreshNeeded,
    /// The session reached its planned expiry.
    Expired,
    /// The control plane reported the session dead before expiry.
    Failed(String),
}

/// Creates, polls, watches, and closes bastion sessions.
pub struct SessionManager {
    api: Arc<dyn CloudApi>,
    backoff: BackoffConfig,
    watch_poll: Duration,
}

impl SessionManager {
    pub fn new(api: Arc<dyn CloudApi>, backoff: BackoffConfig) -> Self {
        Self {
            api,
            backoff,
            watch_poll: DEFAULT_WATCH_POLL,
        }
    }

    /// Shorter failure-poll period for tests.
    pub fn with_watch_poll(mut self, period: Duration) -> Self {
        self.watch_poll = period;
        self
    }

    /// Create a session for `endpoint` behind `bastion` and poll it until it
    /// reports an SSH front-end.
    pub async fn open(
        &self,
        bastion: &Bastion,
        endpoint: &Endpoint,
        public_key: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<BastionSession> {
        if !bastion.lifecycle.can_host_sessions() {
            return Err(SessionError::BastionNotActive {
                id: bastion.id.clone(),
                lifecycle: bastion.lifecycle,
            });
        }

        let request = CreateSessionRequest {
            bastion_id: bastion.id.clone(),
            target_host: endpoint.ip.clone(),
            target_port: endpoint.port,
            public_key: public_key.to_string(),
            ttl,
            display_name: format!("porthole-{}", endpoint.authority()),
        };

        let opened = tokio::time::timeout(OPEN_TIMEOUT, async {
            let created = self.create(&bastion.region, request, cancel).await?;
            info!(session = %created.session_id, bastion = %bastion.id.short(), "bastion session created");
            self.poll_until_active(&bastion.region, created, cancel).await
        })
        .await;

        match opened {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                id: bastion.id.clone(),
                attempts: self.backoff.max_attempts,
            }),
        }
    }

    /// Issue the create call, translating quota rejections and applying the
    /// single credential-refresh retry.
    async fn create(
        &self,
        region: &str,
        request: CreateSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<BastionSession> {
        match self.api.create_session(region, request.clone(), cancel).await {
            Ok(session) => Ok(session),
            Err(CloudError::Unauthorized(msg)) => {
                // One refresh attempt when the capability exposes the hook,
                // then give up.
                if self.api.refresh_credentials().await.unwrap_or(false) {
                    debug!("credentials refreshed, retrying session create once");
                    Ok(self.api.create_session(region, request, cancel).await?)
                } else {
                    Err(CloudError::Unauthorized(msg).into())
                }
            }
            // The service reports exhausted session limits as an invalid
            // request; keep the actionable tag.
            Err(CloudError::InvalidArg(msg))
                if msg.to_ascii_lowercase().contains("quota")
                    || msg.to_ascii_lowercase().contains("limit") =>
            {
                Err(SessionError::QuotaExceeded(msg))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn poll_until_active(
        &self,
        region: &str,
        mut session: BastionSession,
        cancel: &CancellationToken,
    ) -> Result<BastionSession> {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            match session.state {
                SessionState::Active => {
                    if !session.is_consistent() {
                        return Err(SessionError::Terminal {
                            id: session.session_id.clone(),
                            state: "ACTIVE without ssh_host".to_string(),
                        });
                    }
                    info!(
                        session = %session.session_id,
                        ssh_host = %session.ssh_host,
                        "bastion session active"
                    );
                    return Ok(session);
                }
                SessionState::Failed | SessionState::Expired => {
                    return Err(SessionError::Terminal {
                        id: session.session_id.clone(),
                        state: format!("{:?}", session.state).to_uppercase(),
                    });
                }
                SessionState::Creating => {}
            }

            if backoff.exhausted() {
                return Err(SessionError::Timeout {
                    id: session.session_id.clone(),
                    attempts: backoff.attempt(),
                });
            }

            let delay = backoff.next_delay();
            debug!(
                session = %session.session_id,
                attempt = backoff.attempt(),
                ?delay,
                "session not ready, polling again"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(CloudError::cancelled().into()),
            }

            match self.api.get_session(region, &session.session_id, cancel).await {
                Ok(fresh) => session = fresh,
                Err(err) if err.is_retryable() => {
                    warn!(session = %session.session_id, %err, "session poll failed, will retry");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Spawn a watcher for `session`. Events arrive in lifecycle order:
    /// `RefreshNeeded` at `expiry - max(60s, ttl/10)`, then `Expired`; a
    /// `Failed` observed by the health poll preempts both and ends the
    /// stream.
    pub fn watch(
        &self,
        session: &BastionSession,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(4);
        let api = self.api.clone();
        let region = session
            .bastion_id
            .region()
            .unwrap_or_default()
            .to_string();
        let session_id = session.session_id.clone();
        let refresh_at = session.refresh_at();
        let expires_at = session.expires_at();
        let poll_period = self.watch_poll;
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut refresh_sent = false;
            let mut poll = tokio::time::interval(poll_period);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            poll.reset();

            loop {
                let now = Utc::now();
                if !refresh_sent && now >= refresh_at {
                    refresh_sent = true;
                    debug!(session = %session_id, "refresh window open");
                    if tx.send(SessionEvent::RefreshNeeded).await.is_err() {
                        return;
                    }
                    continue;
                }
                if now >= expires_at {
                    let _ = tx.send(SessionEvent::Expired).await;
                    return;
                }

                let next_edge = if refresh_sent { expires_at } else { refresh_at };
                let until_edge = (next_edge - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(until_edge) => {}
                    _ = poll.tick() => {
                        match api.get_session(&region, &session_id, &cancel).await {
                            Ok(fresh) if fresh.state == SessionState::Failed => {
                                let _ = tx.send(SessionEvent::Failed("session reported FAILED".into())).await;
                                return;
                            }
                            Ok(fresh) if fresh.state == SessionState::Expired => {
                                let _ = tx.send(SessionEvent::Expired).await;
                                return;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(session = %session_id, %err, "session health poll failed");
                            }
                        }
                    }
                }
            }
        });

        rx
    }

    /// Best-effort teardown; the session expires server-side regardless.
    pub async fn close(&self, session: &BastionSession, cancel: &CancellationToken) {
        let region = session.bastion_id.region().unwrap_or_default().to_string();
        if let Err(err) = self
            .api
            .delete_session(&region, &session.session_id, cancel)
            .await
        {
            debug!(session = %session.session_id, %err, "session delete failed (ignored)");
        }
    }
}
