use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::db::models::MailConnection;
use crate::db::Database;
use crate::provider::{MailProvider, ProviderError};

/// Tokens are treated as dead this long before their stored expiry, so a
/// token cannot expire between the check and the provider call that uses it.
const EXPIRY_BUFFER_MINUTES: i64 = 5;

pub fn token_expired(expires_at: DateTime<Utc>) -> bool {
    expires_at - Duration::minutes(EXPIRY_BUFFER_MINUTES) <= Utc::now()
}

/// Return a usable access token for the connection, refreshing first when the
/// stored one is expired or inside the safety buffer. A refreshed token is
/// persisted to the connection row before it is returned; no provider call
/// may run on this connection with a stale token.
pub async fn ensure_fresh_token(
    provider: &dyn MailProvider,
    db: &Database,
    connection: &mut MailConnection,
) -> Result<String, ProviderError> {
    if !token_expired(connection.token_expires_at) {
        return Ok(connection.access_token.clone());
    }

    debug!(
        connection = %connection.id,
        "access token expired, refreshing"
    );
    let refreshed = provider
        .refresh_access_token(&connection.refresh_token)
        .await?;
    let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in as i64);

    db.update_connection_token(&connection.id, &refreshed.access_token, &expires_at)
        .map_err(|e| ProviderError::TokenRefresh(format!("persist refreshed token: {e}")))?;

    connection.access_token = refreshed.access_token.clone();
    connection.token_expires_at = expires_at;
    Ok(refreshed.access_token)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{ensure_fresh_token, token_expired};
    use crate::db::models::MailConnection;
    use crate::db::Database;
    use crate::provider::{
        HistoryList, MailProvider, MailboxProfile, MessageList, ProviderError, RawMessage,
        TokenResponse,
    };

    struct RefreshOnlyProvider {
        fail: bool,
    }

    #[async_trait(?Send)]
    impl MailProvider for RefreshOnlyProvider {
        async fn refresh_access_token(
            &self,
            _refresh_token: &str,
        ) -> Result<TokenResponse, ProviderError> {
            if self.fail {
                return Err(ProviderError::TokenRefresh("invalid_grant".to_string()));
            }
            Ok(TokenResponse {
                access_token: "fresh-token".to_string(),
                token_type: Some("Bearer".to_string()),
                expires_in: 3600,
            })
        }

        async fn get_profile(&self, _: &str) -> Result<MailboxProfile, ProviderError> {
            unreachable!("not used by credential tests")
        }

        async fn list_history(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
        ) -> Result<HistoryList, ProviderError> {
            unreachable!("not used by credential tests")
        }

        async fn list_recent_messages(
            &self,
            _: &str,
            _: usize,
        ) -> Result<MessageList, ProviderError> {
            unreachable!("not used by credential tests")
        }

        async fn get_message(&self, _: &str, _: &str) -> Result<RawMessage, ProviderError> {
            unreachable!("not used by credential tests")
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailfeed-auth-test-{}.db", Uuid::new_v4()))
    }

    fn connection(expires_in_minutes: i64) -> MailConnection {
        MailConnection {
            id: "conn-1".to_string(),
            user_id: "user-1".to_string(),
            email_address: "owner@example.com".to_string(),
            access_token: "stale-token".to_string(),
            refresh_token: "refresh-token".to_string(),
            token_expires_at: Utc::now() + Duration::minutes(expires_in_minutes),
            history_cursor: None,
            last_synced_at: None,
            active: true,
            last_error: None,
            last_error_at: None,
        }
    }

    #[test]
    fn expiry_includes_safety_buffer() {
        assert!(token_expired(Utc::now() - Duration::minutes(1)));
        assert!(token_expired(Utc::now() + Duration::minutes(3)));
        assert!(!token_expired(Utc::now() + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn fresh_token_is_reused_without_refresh() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let mut conn = connection(60);

        let provider = RefreshOnlyProvider { fail: true };
        let token = ensure_fresh_token(&provider, &db, &mut conn)
            .await
            .expect("token without refresh");
        assert_eq!(token, "stale-token");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let mut conn = connection(2);
        db.insert_connection(&conn).expect("insert connection");

        let provider = RefreshOnlyProvider { fail: false };
        let token = ensure_fresh_token(&provider, &db, &mut conn)
            .await
            .expect("refresh token");
        assert_eq!(token, "fresh-token");
        assert_eq!(conn.access_token, "fresh-token");
        assert!(!token_expired(conn.token_expires_at));

        let persisted = db
            .get_connection("conn-1")
            .expect("get connection")
            .expect("connection exists");
        assert_eq!(persisted.access_token, "fresh-token");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn refresh_failure_surfaces_as_token_refresh_error() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let mut conn = connection(-10);

        let provider = RefreshOnlyProvider { fail: true };
        let result = ensure_fresh_token(&provider, &db, &mut conn).await;
        assert!(matches!(result, Err(ProviderError::TokenRefresh(_))));
        assert_eq!(conn.access_token, "stale-token");

        let _ = std::fs::remove_file(path);
    }
}
