//! Authentication hook for resolving who a client is.
//!
//! Every connection gets a fresh random challenge in the server's `OK`
//! greeting. The client answers with `AUTH {User, Response, Client}`,
//! where `Response` is [`challenge_response`] computed over the
//! challenge and the client's secret. An [`Authenticator`] checks that
//! answer and resolves it to an [`Auth`]; the rest of the server only
//! ever sees the resolved `Auth`, never secrets.
//!
//! Two implementations ship with the crate:
//! - [`OpenAuthenticator`]: anybody may join under any name; only the
//!   `GM` login can be protected.
//! - [`SharedSecretAuthenticator`]: a group password, an optional GM
//!   password, and optional per-user passwords.

use std::collections::HashMap;
use std::future::Future;

use mapforge_protocol::AuthPayload;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{Auth, SessionError};

/// The user name that requests Game Master privileges.
pub const GM_USER: &str = "GM";

/// Validates a client's `AUTH` answer and returns its identity.
///
/// # Example
///
/// ```rust
/// use mapforge_protocol::AuthPayload;
/// use mapforge_session::{Auth, Authenticator, SessionError};
///
/// /// Lets in exactly one user, with no password.
/// struct OnlyBob;
///
/// impl Authenticator for OnlyBob {
///     async fn authenticate(
///         &self,
///         _challenge: &str,
///         request: &AuthPayload,
///     ) -> Result<Auth, SessionError> {
///         if request.user != "bob" {
///             return Err(SessionError::AuthFailed("bob only".into()));
///         }
///         Ok(Auth { username: "bob".into(), gm_mode: false, client: request.client.clone() })
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Checks `request` against the `challenge` this connection was sent.
    ///
    /// # Returns
    /// - `Ok(Auth)`: the client is who it claims to be
    /// - `Err(SessionError::AuthFailed)`: reply `DENIED` and hang up
    fn authenticate(
        &self,
        challenge: &str,
        request: &AuthPayload,
    ) -> impl Future<Output = Result<Auth, SessionError>> + Send;
}

/// Generates a random 32-character hex challenge (128 bits).
pub fn new_challenge() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// The response a client holding `secret` must send for `challenge`:
/// the lowercase hex SHA-256 of the challenge followed by the secret.
pub fn challenge_response(challenge: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn verify(challenge: &str, secret: &str, response: &str) -> bool {
    challenge_response(challenge, secret).eq_ignore_ascii_case(response.trim())
}

fn require_user(request: &AuthPayload) -> Result<&str, SessionError> {
    let user = request.user.trim();
    if user.is_empty() {
        return Err(SessionError::AuthFailed("a user name is required".into()));
    }
    Ok(user)
}

fn resolved(user: &str, request: &AuthPayload) -> Auth {
    Auth {
        username: user.to_owned(),
        gm_mode: user == GM_USER,
        client: request.client.clone(),
    }
}

// ---------------------------------------------------------------------------
// OpenAuthenticator
// ---------------------------------------------------------------------------

/// Accepts any user name. The `GM` login needs `gm_secret` when one is set.
#[derive(Debug, Clone, Default)]
pub struct OpenAuthenticator {
    gm_secret: Option<String>,
}

impl OpenAuthenticator {
    /// No password anywhere; whoever logs in as `GM` is the GM.
    pub fn new() -> Self {
        Self::default()
    }

    /// Protects the `GM` login with a password.
    pub fn with_gm_secret(secret: impl Into<String>) -> Self {
        Self {
            gm_secret: Some(secret.into()),
        }
    }
}

impl Authenticator for OpenAuthenticator {
    async fn authenticate(
        &self,
        challenge: &str,
        request: &AuthPayload,
    ) -> Result<Auth, SessionError> {
        let user = require_user(request)?;
        if user == GM_USER {
            if let Some(secret) = &self.gm_secret {
                if !verify(challenge, secret, &request.response) {
                    return Err(SessionError::AuthFailed("bad GM credentials".into()));
                }
            }
        }
        Ok(resolved(user, request))
    }
}

// ---------------------------------------------------------------------------
// SharedSecretAuthenticator
// ---------------------------------------------------------------------------

/// Password-protected server.
///
/// Players prove they know either their own per-user secret or, when
/// they have none, the group secret. The `GM` login requires the GM
/// secret and is refused outright when none is configured.
#[derive(Debug, Clone)]
pub struct SharedSecretAuthenticator {
    player_secret: String,
    gm_secret: Option<String>,
    user_secrets: HashMap<String, String>,
}

impl SharedSecretAuthenticator {
    pub fn new(player_secret: impl Into<String>) -> Self {
        Self {
            player_secret: player_secret.into(),
            gm_secret: None,
            user_secrets: HashMap::new(),
        }
    }

    pub fn gm_secret(mut self, secret: impl Into<String>) -> Self {
        self.gm_secret = Some(secret.into());
        self
    }

    /// Gives `user` a personal secret that replaces the group one.
    pub fn user_secret(mut self, user: impl Into<String>, secret: impl Into<String>) -> Self {
        self.user_secrets.insert(user.into(), secret.into());
        self
    }
}

impl Authenticator for SharedSecretAuthenticator {
    async fn authenticate(
        &self,
        challenge: &str,
        request: &AuthPayload,
    ) -> Result<Auth, SessionError> {
        let user = require_user(request)?;
        let secret = if user == GM_USER {
            self.gm_secret
                .as_deref()
                .ok_or_else(|| SessionError::AuthFailed("no GM account on this server".into()))?
        } else {
            self.user_secrets
                .get(user)
                .map(String::as_str)
                .unwrap_or(&self.player_secret)
        };
        if !verify(challenge, secret, &request.response) {
            tracing::warn!(user, "authentication response did not match");
            return Err(SessionError::AuthFailed("bad credentials".into()));
        }
        Ok(resolved(user, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str, challenge: &str, secret: &str) -> AuthPayload {
        AuthPayload {
            response: challenge_response(challenge, secret),
            user: user.into(),
            client: "unit-test".into(),
        }
    }

    // =====================================================================
    // challenges
    // =====================================================================

    #[test]
    fn test_new_challenge_is_32_hex_chars_and_unique() {
        let a = new_challenge();
        let b = new_challenge();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_challenge_response_depends_on_both_inputs() {
        let base = challenge_response("abc", "pw");
        assert_eq!(base.len(), 64);
        assert_ne!(base, challenge_response("abd", "pw"));
        assert_ne!(base, challenge_response("abc", "px"));
    }

    // =====================================================================
    // OpenAuthenticator
    // =====================================================================

    #[tokio::test]
    async fn test_open_any_player_accepted() {
        let auth = OpenAuthenticator::new()
            .authenticate("c", &request("alice", "c", "whatever"))
            .await
            .unwrap();
        assert_eq!(auth.username, "alice");
        assert!(!auth.gm_mode);
        assert_eq!(auth.client, "unit-test");
    }

    #[tokio::test]
    async fn test_open_gm_without_secret_is_gm() {
        let auth = OpenAuthenticator::new()
            .authenticate("c", &request("GM", "c", ""))
            .await
            .unwrap();
        assert!(auth.gm_mode);
    }

    #[tokio::test]
    async fn test_open_gm_with_wrong_secret_rejected() {
        let result = OpenAuthenticator::with_gm_secret("dragon")
            .authenticate("c", &request("GM", "c", "kobold"))
            .await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_open_empty_user_rejected() {
        let result = OpenAuthenticator::new()
            .authenticate("c", &request("  ", "c", ""))
            .await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }

    // =====================================================================
    // SharedSecretAuthenticator
    // =====================================================================

    #[tokio::test]
    async fn test_shared_secret_group_password_accepted() {
        let authn = SharedSecretAuthenticator::new("party");
        let auth = authn
            .authenticate("xyz", &request("bob", "xyz", "party"))
            .await
            .unwrap();
        assert_eq!(auth.username, "bob");
    }

    #[tokio::test]
    async fn test_shared_secret_response_for_other_challenge_rejected() {
        // A replayed answer to somebody else's challenge must not work.
        let authn = SharedSecretAuthenticator::new("party");
        let result = authn
            .authenticate("fresh", &request("bob", "stale", "party"))
            .await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_shared_secret_user_secret_replaces_group_secret() {
        let authn = SharedSecretAuthenticator::new("party").user_secret("carol", "mine");

        let with_group = authn
            .authenticate("c", &request("carol", "c", "party"))
            .await;
        assert!(with_group.is_err());

        let with_own = authn
            .authenticate("c", &request("carol", "c", "mine"))
            .await;
        assert!(with_own.is_ok());
    }

    #[tokio::test]
    async fn test_shared_secret_gm_needs_gm_account() {
        let authn = SharedSecretAuthenticator::new("party");
        let result = authn.authenticate("c", &request("GM", "c", "party")).await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));

        let authn = authn.gm_secret("screen");
        let auth = authn
            .authenticate("c", &request("GM", "c", "screen"))
            .await
            .unwrap();
        assert!(auth.gm_mode);
    }
}
