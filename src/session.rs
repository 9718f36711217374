//! Session establishment.
//!
//! A channel is not usable for application traffic until login
//! completes. The client side sends credentials and waits for the
//! verdict; the server side waits for credentials, consults an
//! [`Authenticator`], and replies. Both directions are bounded by the
//! configured login timeout, and any non-login message seen before the
//! session is established is a protocol violation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dispatch::BoxFuture;
use crate::error::{Result, RpcError};
use crate::pipeline::TxHandle;
use crate::protocol::{LoginResult, Message, SystemMessage};

/// Login credentials presented by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Server-side credential validation.
pub trait Authenticator: Send + Sync + 'static {
    /// Validate credentials. The `Err` reason is forwarded to the peer
    /// in the login response.
    fn authenticate(
        &self,
        credentials: Credentials,
    ) -> BoxFuture<'static, std::result::Result<(), String>>;
}

/// Accepts any credentials. Suitable for transports that are already
/// authenticated out of band.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(
        &self,
        _credentials: Credentials,
    ) -> BoxFuture<'static, std::result::Result<(), String>> {
        Box::pin(async { Ok(()) })
    }
}

/// Client half of session establishment.
pub struct ClientSession {
    credentials: Credentials,
}

impl ClientSession {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Send the login request and wait for the server's verdict.
    ///
    /// The inbound receiver is borrowed for the duration of the
    /// handshake; after success it goes back to the channel router.
    pub async fn establish(
        &self,
        outbound: &TxHandle,
        inbound: &mut mpsc::UnboundedReceiver<Message>,
        timeout: Duration,
    ) -> Result<()> {
        tracing::debug!(username = %self.credentials.username, "logging in");
        outbound
            .send_system(SystemMessage::Login {
                username: self.credentials.username.clone(),
                secret: self.credentials.secret.clone(),
            })
            .await?;

        let reply = tokio::time::timeout(timeout, inbound.recv())
            .await
            .map_err(|_| RpcError::LoginTimeout)?
            .ok_or(RpcError::ChannelClosed)?;

        match reply {
            Message::System(SystemMessage::LoginResponse {
                result: LoginResult::Ok,
                ..
            }) => {
                tracing::debug!("login accepted");
                Ok(())
            }
            Message::System(SystemMessage::LoginResponse {
                result: LoginResult::InvalidCredentials,
                error,
            }) => {
                tracing::warn!("login rejected: {}", error.as_deref().unwrap_or("no reason"));
                Err(RpcError::InvalidCredentials)
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "expected login response, got {}",
                other.kind()
            ))),
        }
    }

    /// Announce an orderly logout to the peer.
    pub async fn logout(&self, outbound: &TxHandle) -> Result<()> {
        outbound.send_system(SystemMessage::Logout).await
    }
}

/// Server half of session establishment.
pub struct ServerSession {
    authenticator: Arc<dyn Authenticator>,
}

impl ServerSession {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    /// Wait for the client's login, validate it, and reply.
    ///
    /// Returns the authenticated username. A rejected login still sends
    /// the response before failing so the client learns the reason.
    pub async fn establish(
        &self,
        outbound: &TxHandle,
        inbound: &mut mpsc::UnboundedReceiver<Message>,
        timeout: Duration,
    ) -> Result<String> {
        let first = tokio::time::timeout(timeout, inbound.recv())
            .await
            .map_err(|_| RpcError::LoginTimeout)?
            .ok_or(RpcError::ChannelClosed)?;

        let (username, secret) = match first {
            Message::System(SystemMessage::Login { username, secret }) => (username, secret),
            other => {
                return Err(RpcError::ProtocolViolation(format!(
                    "expected login, got {}",
                    other.kind()
                )))
            }
        };

        let verdict = self
            .authenticator
            .authenticate(Credentials::new(username.clone(), secret))
            .await;

        match verdict {
            Ok(()) => {
                tracing::debug!(username = %username, "login accepted");
                outbound
                    .send_system(SystemMessage::LoginResponse {
                        result: LoginResult::Ok,
                        error: None,
                    })
                    .await?;
                Ok(username)
            }
            Err(reason) => {
                tracing::warn!(username = %username, "login rejected: {reason}");
                outbound
                    .send_system(SystemMessage::LoginResponse {
                        result: LoginResult::InvalidCredentials,
                        error: Some(reason),
                    })
                    .await?;
                Err(RpcError::InvalidCredentials)
            }
        }
    }
}
