// Shared test fixtures: a scripted mock transport that records every
// call and serves queued or default responses.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as Json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rusty_erp::error::{ClientError, Result};
use rusty_erp::transport::RpcTransport;
use rusty_erp::OdooClient;

/// One recorded `execute_kw` invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub method: String,
    pub args: Vec<Json>,
    pub kwargs: Map<String, Json>,
}

/// Failure kinds the mock can be scripted to return.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Connection(String),
    Validation(String),
    Server(String),
}

impl MockFailure {
    fn into_error(self) -> ClientError {
        match self {
            MockFailure::Connection(m) => ClientError::Connection(m),
            MockFailure::Validation(m) => ClientError::Validation(m),
            MockFailure::Server(m) => ClientError::Server(m),
        }
    }
}

/// Scripted transport. Responses and failures queue per
/// `{model}:{method}`; unscripted calls get sensible defaults
/// (incrementing ids for create, `true` for write/unlink, seeded rows
/// for read, empty results otherwise).
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<HashMap<String, VecDeque<Json>>>,
    failures: Mutex<HashMap<String, VecDeque<MockFailure>>>,
    seed: Mutex<HashMap<(String, i64), Json>>,
    next_id: AtomicI64,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(100),
            ..Default::default()
        })
    }

    /// Queue a response for the next `{model}:{method}` call.
    pub fn push_response(&self, model: &str, method: &str, response: Json) {
        self.responses
            .lock()
            .entry(format!("{}:{}", model, method))
            .or_default()
            .push_back(response);
    }

    /// Queue a failure for the next `{model}:{method}` call.
    pub fn push_failure(&self, model: &str, method: &str, failure: MockFailure) {
        self.failures
            .lock()
            .entry(format!("{}:{}", model, method))
            .or_default()
            .push_back(failure);
    }

    /// Seed a record served by default `read` handling.
    pub fn seed_record(&self, model: &str, id: i64, fields: Json) {
        self.seed.lock().insert((model.to_string(), id), fields);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, model: &str, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.model == model && c.method == method)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, model: &str, method: &str) -> usize {
        self.calls_for(model, method).len()
    }

    fn default_response(&self, call: &RecordedCall) -> Result<Json> {
        match call.method.as_str() {
            "create" => {
                // List input -> list of ids; object input -> one id.
                match call.args.first() {
                    Some(Json::Array(items)) => {
                        let ids: Vec<i64> = items
                            .iter()
                            .map(|_| self.next_id.fetch_add(1, Ordering::SeqCst))
                            .collect();
                        Ok(json!(ids))
                    }
                    _ => Ok(json!(self.next_id.fetch_add(1, Ordering::SeqCst))),
                }
            }
            "write" | "unlink" => Ok(json!(true)),
            "read" => {
                let ids: Vec<i64> = call
                    .args
                    .first()
                    .and_then(Json::as_array)
                    .map(|items| items.iter().filter_map(Json::as_i64).collect())
                    .unwrap_or_default();

                let seed = self.seed.lock();
                let rows: Vec<Json> = ids
                    .iter()
                    .map(|id| {
                        match seed.get(&(call.model.clone(), *id)) {
                            Some(fields) => {
                                let mut row = fields.clone();
                                if let Some(object) = row.as_object_mut() {
                                    object.insert("id".to_string(), json!(id));
                                }
                                row
                            }
                            None => json!({"id": id, "name": format!("Record {}", id)}),
                        }
                    })
                    .collect();
                Ok(json!(rows))
            }
            "search_read" => Ok(json!([])),
            "search_count" => Ok(json!(0)),
            other => Err(ClientError::Server(format!(
                "mock has no default for method '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Vec<Json>,
        kwargs: Map<String, Json>,
    ) -> Result<Json> {
        let call = RecordedCall {
            model: model.to_string(),
            method: method.to_string(),
            args,
            kwargs,
        };
        self.calls.lock().push(call.clone());

        let key = format!("{}:{}", model, method);

        if let Some(failure) = self
            .failures
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure.into_error());
        }

        if let Some(response) = self
            .responses
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }

        self.default_response(&call)
    }
}

static TRACING: std::sync::Once = std::sync::Once::new();

/// A client over a fresh mock transport, with test logging wired up.
pub fn mock_client() -> (OdooClient, Arc<MockTransport>) {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    let transport = MockTransport::new();
    let client = OdooClient::with_transport(transport.clone());
    (client, transport)
}
