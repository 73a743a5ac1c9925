//! Shared helpers for integration tests.
//!
//! Token minting lives here only; the library never issues credentials.

#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpListener;
use uuid::Uuid;

use mininote_collab::server::{ServerConfig, SyncServer};

pub const SECRET: &str = "integration-secret";

fn sign(secret: &str, claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    let input = format!("{header}.{claims}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(input.as_bytes());
    format!("{input}.{}", URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Valid token for `principal`, expiring in an hour.
pub fn mint_token(principal: Uuid) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    sign(SECRET, &json!({ "id": principal.to_string(), "exp": exp }))
}

/// Token that expired well outside any leeway.
pub fn mint_expired_token(principal: Uuid) -> String {
    let exp = chrono::Utc::now().timestamp() - 3600;
    sign(SECRET, &json!({ "id": principal.to_string(), "exp": exp }))
}

/// Token signed with a different secret.
pub fn mint_foreign_token(principal: Uuid) -> String {
    sign("someone-else", &json!({ "id": principal.to_string() }))
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        jwt_secret: SECRET.to_string(),
        outbox_capacity: 64,
        store_timeout_ms: 2000,
        ..ServerConfig::default()
    }
}

/// Serve `server` on a free port. Returns the ws:// URL.
pub async fn serve(server: Arc<SyncServer>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

/// Start an in-memory server. Returns it with its URL.
pub async fn start_test_server() -> (Arc<SyncServer>, String) {
    let server = Arc::new(SyncServer::new(test_config()).unwrap());
    let url = serve(server.clone()).await;
    (server, url)
}
