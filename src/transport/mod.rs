// RPC transport seam.
//
// Everything the client does goes through `RpcTransport::execute_kw`;
// the bundled implementation speaks JSON-RPC over HTTP, and tests plug
// in scripted transports.

pub mod jsonrpc;

use async_trait::async_trait;
use serde_json::{Map, Value as Json};

use crate::error::Result;

/// Uniform RPC entry point.
///
/// Bulk methods accept lists and return lists of the same arity;
/// `create` returns an id or a list of ids depending on input arity;
/// `write` and `unlink` return booleans.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Vec<Json>,
        kwargs: Map<String, Json>,
    ) -> Result<Json>;
}

pub use jsonrpc::{JsonRpcTransport, JsonRpcTransportConfig};
