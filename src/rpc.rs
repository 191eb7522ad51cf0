use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport failure calling {method}: {reason}")]
    Transport { method: String, reason: String },
    #[error("{method} rejected ({code}): {message}")]
    Rejected {
        method: String,
        code: i64,
        message: String,
    },
    #[error("malformed {method} response: {reason}")]
    Decode { method: String, reason: String },
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Minimal JSON-RPC 2.0 client over HTTP
#[derive(Debug)]
pub struct JsonRpcClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method`, returning `None` when the node answers with a null result
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let transport = |reason: String| RpcError::Transport {
            method: method.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(transport(format!("HTTP {status}: {body}")));
        }

        let body: JsonRpcResponse = response.json().await.map_err(|e| RpcError::Decode {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(error) = body.error {
            let message = match error.data {
                Some(data) => format!("{} ({data})", error.message),
                None => error.message,
            };
            return Err(RpcError::Rejected {
                method: method.to_string(),
                code: error.code,
                message,
            });
        }

        match body.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RpcError::Decode {
                    method: method.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| RpcError::Decode {
                method: method.to_string(),
                reason: "missing result".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_parses() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"bad params"}}"#;
        let parsed: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        let error = parsed.error.unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(error.message, "bad params");
        assert!(parsed.result.is_none());
    }

    #[test]
    fn test_request_serializes_as_jsonrpc() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "eth_chainId",
            params: serde_json::json!([]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "eth_chainId");
    }

    #[test]
    fn test_client_builds() {
        let client = JsonRpcClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:1");
    }
}
