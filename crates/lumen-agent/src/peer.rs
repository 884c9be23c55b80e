//! Peer RPC surface.
//!
//! Three endpoints on one router, built lazily on first access:
//!
//!   POST /starlight/message        — channel messages from remote agents
//!   GET  /federation               — federation lookup for the local user
//!   GET  /.well-known/stellar.toml — discovery of the above
//!
//! Retriable protocol conflicts map to 503 so the peer's delivery queue
//! keeps re-sending; validation failures map to 400 and stop the retry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Host, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::agent::{protocol, Agent};
use crate::db;
use crate::errors::Error;
use crate::fsm::Message;

impl Agent {
    /// The peer-facing router; constructed once.
    pub fn peer_router(self: &Arc<Self>) -> Router {
        self.router
            .get_or_init(|| {
                Router::new()
                    .route("/starlight/message", post(handle_msg))
                    .route("/federation", get(handle_fed))
                    .route("/.well-known/stellar.toml", get(handle_toml))
                    .with_state(self.clone())
            })
            .clone()
    }
}

/// Map an agent error onto the wire: retriable conflicts ask the peer to
/// try again later, validation problems are final.
fn error_response(err: &Error) -> Response {
    let status = if err.is_retriable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        match err {
            Error::Store(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn handle_msg(
    State(agent): State<Arc<Agent>>,
    body: Result<Json<Message>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(msg) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(&Error::Unmarshal(e.to_string()));
        }
    };
    match agent.handle_peer_message(msg, true).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::debug!("peer message rejected: {e}");
            error_response(&e)
        }
    }
}

async fn handle_fed(
    State(agent): State<Arc<Agent>>,
    Host(host): Host,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("type").map(String::as_str) != Some("name") {
        return (StatusCode::NOT_IMPLEMENTED, "not implemented").into_response();
    }
    let looked_up = agent.store.read(|tx| -> crate::errors::Result<_> {
        let config = db::config(tx)?;
        let acct = db::primary_acct(tx)?;
        Ok(config.map(|c| c.username).zip(acct))
    });
    let Ok(Some((username, acct))) = looked_up else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    let expected = format!("{username}*{host}");
    if params.get("q") != Some(&expected) {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    Json(serde_json::json!({
        "stellar_address": expected,
        "account_id": acct.to_string(),
    }))
    .into_response()
}

async fn handle_toml(Host(host): Host) -> Response {
    let origin = format!("{}{host}", protocol(&host));
    let body = format!(
        "FEDERATION_SERVER=\"{origin}/federation\"\nSTARLIGHT_SERVER=\"{origin}/\"\n"
    );
    (
        [
            ("Access-Control-Allow-Origin", "*"),
            ("Content-Type", "text/plain"),
        ],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParams;
    use crate::fsm::{Channel, CloseMsg, MessageBody, Role};
    use lumen_store::Store;

    async fn served_agent() -> (Arc<Agent>, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.redb")).unwrap();
        let agent = Agent::start(store).unwrap();
        agent
            .config_init(
                &ConfigParams {
                    username: "alice".into(),
                    password: "hunter2".into(),
                    horizon_url: "http://127.0.0.1:9".into(),
                    public: true,
                    ..ConfigParams::default()
                },
                "h.example",
            )
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = agent.peer_router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (agent, format!("http://{addr}"), dir)
    }

    #[tokio::test]
    async fn federation_resolves_local_user_only() {
        let (agent, base, _dir) = served_agent().await;
        let host = base.strip_prefix("http://").unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/federation?type=name&q=alice*{host}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["stellar_address"], format!("alice*{host}"));
        assert_eq!(v["account_id"].as_str().unwrap().len(), 64);

        let resp = client
            .get(format!("{base}/federation?type=name&q=bob*{host}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .get(format!("{base}/federation?type=id&q=whatever"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 501);
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn stellar_toml_advertises_servers() {
        let (agent, base, _dir) = served_agent().await;
        let body = reqwest::get(format!("{base}/.well-known/stellar.toml"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("FEDERATION_SERVER="));
        assert!(body.contains("STARLIGHT_SERVER="));
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn host_role_rejects_pushed_messages() {
        let (agent, base, _dir) = served_agent().await;

        let escrow = account_id_from_index(7);
        let mut ch = Channel::new(escrow.as_str());
        ch.role = Role::Host;
        agent
            .store
            .write(|tx| db::put_channel(tx, &ch))
            .unwrap();

        let msg = Message {
            channel_id: ch.id.clone(),
            msg_num: 1,
            body: MessageBody::Close(CloseMsg { round: 1 }),
        };
        let resp = reqwest::Client::new()
            .post(format!("{base}/starlight/message"))
            .json(&msg)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert!(v["error"].as_str().unwrap().contains("pulled"));
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn garbage_body_is_a_bad_request() {
        let (agent, base, _dir) = served_agent().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/starlight/message"))
            .header("content-type", "application/json")
            .body("{\"nope\":")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn unknown_channel_message_is_rejected() {
        let (agent, base, _dir) = served_agent().await;
        let msg = Message {
            channel_id: "ab".repeat(32),
            msg_num: 1,
            body: MessageBody::Close(CloseMsg { round: 1 }),
        };
        let resp = reqwest::Client::new()
            .post(format!("{base}/starlight/message"))
            .json(&msg)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        agent.close_wait().await;
    }

    fn account_id_from_index(n: u8) -> lumen_ledger::AccountId {
        lumen_ledger::AccountId::from_verifying_key(
            &crate::keys::derive_key(&[n; 32], 0).verifying_key(),
        )
    }
}
