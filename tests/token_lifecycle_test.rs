// Integration tests for the token lifecycle against a mock OAuth token endpoint.
//
// Each test wires the real SQLite store, AES-GCM cipher and HTTP token client,
// so refreshes travel the same path as in production.

use gridlink::config::GridlinkConfig;
use gridlink::tokens::TokenGrant;
use gridlink::{
    AesGcmCipher, ConnectionState, ConnectionStore, Error, OAuthClient, Provider,
    SqliteConnectionStore, TokenManager,
};
use mockito::{Matcher, Server};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

fn config_for(server: &Server) -> GridlinkConfig {
    let raw = format!(
        r#"
        [tokens]
        refresh_base_delay_ms = 10
        refresh_max_jitter_ms = 0

        [providers.google_sheets]
        token_url = "{url}/token"
        client_id = "cid"
        client_secret = "csecret"

        [providers.airtable]
        token_url = "{url}/airtable/token"
        client_id = "aid"
        client_secret = "asecret"
        "#,
        url = server.url()
    );
    GridlinkConfig::from_toml_str(&raw).unwrap()
}

fn build_manager(config: &GridlinkConfig, db: &Path) -> (TokenManager, Arc<SqliteConnectionStore>) {
    let store = Arc::new(SqliteConnectionStore::new(db).unwrap());
    let cipher = Arc::new(AesGcmCipher::new(KEY).unwrap());
    let manager = TokenManager::new(
        store.clone(),
        cipher,
        Arc::new(OAuthClient::new(config).unwrap()),
        config,
    );
    (manager, store)
}

fn grant(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenGrant {
    TokenGrant {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_in: Some(expires_in),
        scope: None,
    }
}

#[tokio::test]
async fn test_expiring_token_refreshed_and_persisted() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            Matcher::UrlEncoded("client_id".into(), "cid".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "access-2", "expires_in": 3600, "token_type": "Bearer"}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let db = dir.path().join("connections.db");
    let config = config_for(&server);

    {
        let (manager, _) = build_manager(&config, &db);
        // Expires in two minutes: inside the refresh window.
        manager
            .store_grant("u1", Provider::GoogleSheets, grant("access-1", Some("refresh-1"), 120))
            .await
            .unwrap();

        let token = manager
            .get_valid_token("u1", Provider::GoogleSheets)
            .await
            .unwrap();
        assert_eq!(token, "access-2");
    }

    // Reopened store serves the refreshed token without another refresh.
    let (manager, store) = build_manager(&config, &db);
    let token = manager
        .get_valid_token("u1", Provider::GoogleSheets)
        .await
        .unwrap();
    assert_eq!(token, "access-2");

    let conn = store.find("u1", Provider::GoogleSheets).await.unwrap().unwrap();
    assert!(conn.encrypted_refresh_token.is_some());
    assert!(!conn.needs_reauth);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_invalid_grant_flips_to_needs_reauth() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/airtable/token")
        .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "invalid_grant", "error_description": "refresh token revoked"}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let config = config_for(&server);
    let (manager, _) = build_manager(&config, &dir.path().join("connections.db"));
    manager
        .store_grant("u1", Provider::Airtable, grant("access-1", Some("refresh-1"), 0))
        .await
        .unwrap();

    let err = manager
        .get_valid_token("u1", Provider::Airtable)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReauthRequired { .. }));
    assert_eq!(err.user_action(), gridlink::UserAction::Reconnect);

    let status = manager.status("u1", Provider::Airtable).await.unwrap();
    assert_eq!(status.state, ConnectionState::NeedsReauth);
    assert!(status.last_error.unwrap().contains("invalid_grant"));

    // Fails fast from stored state.
    assert!(manager.get_valid_token("u1", Provider::Airtable).await.is_err());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_errors_exhaust_refresh_budget() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(503)
        .with_body("upstream unavailable")
        .expect(3)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let config = config_for(&server);
    let (manager, _) = build_manager(&config, &dir.path().join("connections.db"));
    manager
        .store_grant("u1", Provider::GoogleSheets, grant("access-1", Some("refresh-1"), 0))
        .await
        .unwrap();

    let err = manager
        .get_valid_token("u1", Provider::GoogleSheets)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RefreshFailed { attempts: 3, .. }));

    let status = manager.status("u1", Provider::GoogleSheets).await.unwrap();
    assert_eq!(status.state, ConnectionState::NeedsReauth);
    assert!(status.last_attempt_at.is_some());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "access-2", "refresh_token": "refresh-2", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let config = config_for(&server);
    let (manager, _) = build_manager(&config, &dir.path().join("connections.db"));
    let manager = Arc::new(manager);
    manager
        .store_grant("u1", Provider::GoogleSheets, grant("access-1", Some("refresh-1"), 0))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.get_valid_token("u1", Provider::GoogleSheets).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "access-2");
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_connect_exchanges_authorization_code() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "consent-code".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "access-1", "refresh_token": "refresh-1", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let config = config_for(&server);
    let (manager, store) = build_manager(&config, &dir.path().join("connections.db"));

    manager
        .connect("u1", Provider::GoogleSheets, "consent-code", "http://localhost/callback")
        .await
        .unwrap();

    assert_eq!(
        manager.get_valid_token("u1", Provider::GoogleSheets).await.unwrap(),
        "access-1"
    );
    assert_eq!(store.list_by_user("u1").await.unwrap(), vec![Provider::GoogleSheets]);

    let url = manager.authorization_url(Provider::GoogleSheets, "st", "http://localhost/callback");
    assert!(url.contains("client_id=cid"));

    assert!(manager.disconnect("u1", Provider::GoogleSheets).await.unwrap());
    assert!(store.list_by_user("u1").await.unwrap().is_empty());
    mock.assert_async().await;
}
