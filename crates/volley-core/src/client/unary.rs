//! Unary invocation

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::{Client, ClientError};
use crate::metrics::MetricTags;
use crate::params::CallParams;
use crate::transport::CallContext;

/// What a unary call hands back to the script
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnaryResponse {
    /// HTTP status equivalent of the RPC outcome
    pub status: u16,
    /// Response message, or `{code, message, details}` when the call failed
    pub message: Value,
    pub headers: HashMap<String, String>,
    pub trailers: HashMap<String, String>,
}

impl UnaryResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

impl Client {
    /// Call a unary method.
    ///
    /// RPC failures come back inside the response; `Err` is reserved for
    /// problems building or decoding the call.
    pub async fn invoke(
        &self,
        method: &str,
        request: &Value,
        options: Option<&Value>,
    ) -> Result<UnaryResponse, ClientError> {
        let connection = self.connection()?;
        let schema = self.schemas.resolve(method).inspect_err(|e| {
            tracing::error!(method, error = %e, "Failed to get method descriptor");
        })?;
        let call = CallParams::from_value(options).map_err(ClientError::CallParams)?;

        let codec = connection.content_type().codec();
        let body = codec
            .encode(request, schema.input_schema())
            .map_err(ClientError::Encode)?;
        let tags = MetricTags::for_call(
            &schema.info,
            connection.protocol(),
            connection.content_type(),
            &call.tags,
        );

        let ctx = CallContext::new(self.handle.context(), call.timeout);
        let started = Instant::now();
        let result = connection
            .unary(&schema.info, body, &call.metadata, ctx)
            .await;
        let elapsed = started.elapsed();

        match result {
            Ok(reply) => {
                let message = if call.discard_response {
                    Value::Null
                } else {
                    codec
                        .decode(&reply.message, schema.output_schema())
                        .map_err(ClientError::Decode)?
                };
                self.metrics.record_unary_request(&tags, elapsed, "ok");
                Ok(UnaryResponse {
                    status: 200,
                    message,
                    headers: reply.headers,
                    trailers: reply.trailers,
                })
            }
            Err(e) => {
                tracing::debug!(method, error = %e, "Unary call failed");
                self.metrics
                    .record_unary_request(&tags, elapsed, e.code().as_str());
                Ok(UnaryResponse {
                    status: e.code().http_status(),
                    message: e.payload_with_pool(&self.schemas.pool()),
                    headers: HashMap::new(),
                    trailers: HashMap::new(),
                })
            }
        }
    }
}
