//! Credentials for backend connections.
//!
//! A [`TokenProvider`] is asked for a credential on every connection
//! attempt. IAM tokens are short-lived and only need to survive the
//! handshake, so nothing is cached.

use std::fmt;

use async_trait::async_trait;

use crate::error::DsqlError;

/// Produces the password for one connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    /// Mint (or return) a credential.
    async fn token(&self) -> Result<String, DsqlError>;
}

/// A fixed password, for local `PostgreSQL`.
#[derive(Clone)]
pub struct StaticPassword(String);

impl StaticPassword {
    /// Wrap a password.
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }
}

impl fmt::Debug for StaticPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticPassword(<redacted>)")
    }
}

#[async_trait]
impl TokenProvider for StaticPassword {
    async fn token(&self) -> Result<String, DsqlError> {
        Ok(self.0.clone())
    }
}

#[cfg(feature = "iam-auth")]
pub use iam::IamTokenProvider;

#[cfg(feature = "iam-auth")]
mod iam {
    use std::time::Duration;

    use async_trait::async_trait;
    use aws_config::{BehaviorVersion, Region, SdkConfig};
    use aws_sdk_dsql::auth_token::{AuthTokenGenerator, Config};

    use super::TokenProvider;
    use crate::error::DsqlError;

    /// Mints a DSQL IAM auth token per connection attempt.
    ///
    /// The `admin` user gets an admin token; every other user gets a
    /// regular `DbConnect` token.
    pub struct IamTokenProvider {
        sdk_config: SdkConfig,
        generator: AuthTokenGenerator,
        admin: bool,
    }

    impl std::fmt::Debug for IamTokenProvider {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("IamTokenProvider")
                .field("admin", &self.admin)
                .finish_non_exhaustive()
        }
    }

    impl IamTokenProvider {
        /// Load AWS credentials from the default chain and build a generator
        /// for `endpoint` in `region`.
        ///
        /// # Errors
        ///
        /// Returns [`DsqlError::Token`] if the generator config is invalid.
        pub async fn from_env(
            endpoint: &str,
            region: &str,
            user: &str,
            expires_in: Duration,
        ) -> Result<Self, DsqlError> {
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.to_owned()))
                .load()
                .await;
            let config = Config::builder()
                .hostname(endpoint)
                .region(Region::new(region.to_owned()))
                .expires_in(expires_in.as_secs())
                .build()
                .map_err(|e| DsqlError::Token(format!("invalid token generator config: {e}")))?;
            Ok(Self {
                sdk_config,
                generator: AuthTokenGenerator::new(config),
                admin: user == "admin",
            })
        }
    }

    #[async_trait]
    impl TokenProvider for IamTokenProvider {
        async fn token(&self) -> Result<String, DsqlError> {
            let token = if self.admin {
                self.generator
                    .db_connect_admin_auth_token(&self.sdk_config)
                    .await
            } else {
                self.generator.db_connect_auth_token(&self.sdk_config).await
            };
            token
                .map(|t| t.to_string())
                .map_err(|e| DsqlError::Token(e.to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_password_is_returned_every_time() {
        let provider = StaticPassword::new("hunter2");
        assert_eq!(provider.token().await.unwrap(), "hunter2");
        assert_eq!(provider.token().await.unwrap(), "hunter2");
    }

    #[test]
    fn static_password_is_redacted() {
        let provider = StaticPassword::new("hunter2");
        assert!(!format!("{provider:?}").contains("hunter2"));
    }
}
