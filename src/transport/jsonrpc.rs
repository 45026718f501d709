// JSON-RPC transport.
//
// Speaks the ERP server's JSON-RPC envelope over HTTP: authentication
// through the `common` service, everything else through
// `object.execute_kw`. Wire faults are mapped into the client error
// taxonomy before they surface.

use async_trait::async_trait;
use serde_json::{json, Map, Value as Json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::transport::RpcTransport;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct JsonRpcTransportConfig {
    /// Server base URL, e.g. `https://erp.example.com`.
    pub url: String,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Connection pool size.
    pub max_connections: usize,
}

impl Default for JsonRpcTransportConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8069".to_string(),
            timeout: Duration::from_secs(30),
            max_connections: 10,
        }
    }
}

struct SessionState {
    database: Option<String>,
    uid: Option<i64>,
    password: Option<String>,
}

/// HTTP JSON-RPC transport with a pooled connection and keepalives.
pub struct JsonRpcTransport {
    config: JsonRpcTransportConfig,
    http: reqwest::Client,
    session: parking_lot::RwLock<SessionState>,
    request_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(config: JsonRpcTransportConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(Self {
            config,
            http,
            session: parking_lot::RwLock::new(SessionState {
                database: None,
                uid: None,
                password: None,
            }),
            request_id: AtomicU64::new(1),
        })
    }

    /// Authenticate against the `common` service and remember the
    /// session for subsequent `execute_kw` calls.
    pub async fn authenticate(&self, database: &str, login: &str, password: &str) -> Result<i64> {
        let result = self
            .call(
                "common",
                "authenticate",
                json!([database, login, password, {}]),
            )
            .await?;

        let uid = result.as_i64().ok_or_else(|| {
            ClientError::Authentication(format!(
                "authentication rejected for '{}' on database '{}'",
                login, database
            ))
        })?;

        let mut session = self.session.write();
        session.database = Some(database.to_string());
        session.uid = Some(uid);
        session.password = Some(password.to_string());
        info!(uid, database, "authenticated");
        Ok(uid)
    }

    /// True when an authenticated session is held.
    pub fn is_authenticated(&self) -> bool {
        self.session.read().uid.is_some()
    }

    /// Authenticated user id, if any.
    pub fn uid(&self) -> Option<i64> {
        self.session.read().uid
    }

    /// Drop session state.
    pub fn clear_session(&self) {
        let mut session = self.session.write();
        session.database = None;
        session.uid = None;
        session.password = None;
    }

    async fn call(&self, service: &str, method: &str, args: Json) -> Result<Json> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args,
            },
            "id": id,
        });

        debug!(service, method, id, "jsonrpc request");
        let response = self
            .http
            .post(format!("{}/jsonrpc", self.config.url))
            .json(&payload)
            .send()
            .await
            .map_err(map_http_error)?;

        let body: Json = response.json().await.map_err(map_http_error)?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(map_server_fault(error));
        }

        Ok(body.get("result").cloned().unwrap_or(Json::Null))
    }
}

#[async_trait]
impl RpcTransport for JsonRpcTransport {
    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Vec<Json>,
        kwargs: Map<String, Json>,
    ) -> Result<Json> {
        let (database, uid, password) = {
            let session = self.session.read();
            match (&session.database, session.uid, &session.password) {
                (Some(db), Some(uid), Some(pw)) => (db.clone(), uid, pw.clone()),
                _ => {
                    return Err(ClientError::Authentication(
                        "not authenticated; call login() first".to_string(),
                    ))
                }
            }
        };

        self.call(
            "object",
            "execute_kw",
            json!([database, uid, password, model, method, args, kwargs]),
        )
        .await
    }
}

fn map_http_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(err.to_string())
    } else if err.is_connect() {
        ClientError::Connection(err.to_string())
    } else {
        ClientError::Server(err.to_string())
    }
}

/// Map a JSON-RPC fault payload into the client taxonomy.
///
/// The server names the raising exception class in `error.data.name`;
/// that name decides the variant.
fn map_server_fault(error: &Json) -> ClientError {
    let message = error
        .get("data")
        .and_then(|d| d.get("message"))
        .or_else(|| error.get("message"))
        .and_then(Json::as_str)
        .unwrap_or("unknown server error")
        .to_string();

    let exception_name = error
        .get("data")
        .and_then(|d| d.get("name"))
        .and_then(Json::as_str)
        .unwrap_or_default();

    if exception_name.contains("AccessDenied") || exception_name.contains("SessionExpired") {
        ClientError::Authentication(message)
    } else if exception_name.contains("AccessError") {
        ClientError::Access(message)
    } else if exception_name.contains("ValidationError")
        || exception_name.contains("UserError")
        || exception_name.contains("IntegrityError")
    {
        ClientError::Validation(message)
    } else if exception_name.contains("MissingError") {
        ClientError::NotFound(message)
    } else {
        ClientError::Server(message)
    }
}
