//! Plugin side of the wire protocol.
//!
//! A plugin executable implements [`MetadataPlugin`] and hands it to
//! [`serve_stdio`], which answers framed JSON-RPC requests on stdin/stdout
//! until the host sends `close` or closes the pipe. Logging must go to
//! stderr; stdout belongs to the protocol.

use super::protocol::{
    code, method, read_frame, write_message, InitializeParams, MetadataResult, RpcRequest,
    RpcResponse,
};
use super::{MetadataPlugin, MetadataRequest};
use crate::config::PluginProtocolConfig;
use crate::error::Result;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Serve `plugin` over the process's stdin/stdout.
pub async fn serve_stdio<P: MetadataPlugin + ?Sized>(plugin: &P) -> Result<()> {
    serve(plugin, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve `plugin` over any reader/writer pair.
///
/// Returns after answering `close`, or when the reader reaches EOF.
pub async fn serve<P, R, W>(plugin: &P, mut reader: R, mut writer: W) -> Result<()>
where
    P: MetadataPlugin + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = read_frame(&mut reader).await? else {
            debug!("Host closed the channel");
            return Ok(());
        };

        let request: RpcRequest = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                let response = RpcResponse::error(None, code::PARSE_ERROR, format!("Parse error: {}", e));
                write_message(&mut writer, &response).await?;
                continue;
            }
        };

        let closing = request.method == method::CLOSE;
        let response = dispatch(plugin, request).await;
        write_message(&mut writer, &response).await?;

        if closing {
            info!("Plugin closed by host");
            return Ok(());
        }
    }
}

async fn dispatch<P: MetadataPlugin + ?Sized>(plugin: &P, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    if request.jsonrpc != "2.0" {
        return RpcResponse::error(
            id,
            code::INVALID_REQUEST,
            "Invalid Request: expected jsonrpc 2.0".to_string(),
        );
    }
    let params = request
        .params
        .unwrap_or(serde_json::Value::Object(Default::default()));

    debug!("Handling {}", request.method);
    match request.method.as_str() {
        method::INITIALIZE => {
            let params: InitializeParams = match parse_params(params) {
                Ok(params) => params,
                Err(response) => return response.with_id(id),
            };
            if params.protocol_version != PluginProtocolConfig::PROTOCOL_VERSION {
                return RpcResponse::error(
                    id,
                    code::INVALID_PARAMS,
                    format!(
                        "unsupported protocol version {} (expected {})",
                        params.protocol_version,
                        PluginProtocolConfig::PROTOCOL_VERSION
                    ),
                );
            }
            match plugin.initialize(params.config).await {
                Ok(()) => RpcResponse::success(id, serde_json::json!({})),
                Err(e) => RpcResponse::error(id, e.to_rpc_error_code(), e.to_string()),
            }
        }
        method::GET_METADATA => {
            let params: MetadataRequest = match parse_params(params) {
                Ok(params) => params,
                Err(response) => return response.with_id(id),
            };
            // Plugin failures travel in the result's `error` field.
            let result = match plugin.get_metadata(&params).await {
                Ok(metadata) => MetadataResult::ok(metadata),
                Err(e) => {
                    warn!("get_metadata for {} failed: {}", params.domain, e);
                    MetadataResult::failed(e.to_string())
                }
            };
            match serde_json::to_value(&result) {
                Ok(value) => RpcResponse::success(id, value),
                Err(e) => RpcResponse::error(id, code::INTERNAL_ERROR, e.to_string()),
            }
        }
        method::CLOSE => match plugin.close().await {
            Ok(()) => RpcResponse::success(id, serde_json::json!({})),
            Err(e) => RpcResponse::error(id, e.to_rpc_error_code(), e.to_string()),
        },
        other => RpcResponse::error(
            id,
            code::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        ),
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> std::result::Result<T, RpcResponse> {
    serde_json::from_value(params)
        .map_err(|e| RpcResponse::error(None, code::INVALID_PARAMS, format!("Invalid params: {}", e)))
}

impl RpcResponse {
    fn with_id(mut self, id: Option<serde_json::Value>) -> Self {
        self.id = id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CertdeckError;
    use crate::plugins::protocol::write_frame;
    use crate::value::ValueMap;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct Echo {
        closed: AtomicBool,
    }

    #[async_trait]
    impl MetadataPlugin for Echo {
        async fn initialize(&self, config: ValueMap) -> Result<()> {
            if config.contains_key("reject") {
                return Err(CertdeckError::Config {
                    message: "rejected".into(),
                });
            }
            Ok(())
        }

        async fn get_metadata(&self, request: &MetadataRequest) -> Result<ValueMap> {
            if request.domain == "bad.example.com" {
                return Err(CertdeckError::Other("no record".into()));
            }
            let mut out = ValueMap::new();
            out.insert("echo".into(), request.domain.as_str().into());
            Ok(out)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Host {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        next_id: u64,
    }

    impl Host {
        async fn call(&mut self, method: &str, params: serde_json::Value) -> RpcResponse {
            self.next_id += 1;
            let request = RpcRequest::new(method, params, self.next_id);
            write_message(&mut self.writer, &request).await.unwrap();
            let frame = read_frame(&mut self.reader).await.unwrap().unwrap();
            serde_json::from_slice(&frame).unwrap()
        }
    }

    fn start(plugin: std::sync::Arc<Echo>) -> (Host, tokio::task::JoinHandle<Result<()>>) {
        let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
        let (plugin_reader, plugin_writer) = tokio::io::split(plugin_side);
        let task = tokio::spawn(async move { serve(&*plugin, plugin_reader, plugin_writer).await });
        let (reader, writer) = tokio::io::split(host_side);
        (
            Host {
                reader,
                writer,
                next_id: 0,
            },
            task,
        )
    }

    #[tokio::test]
    async fn test_full_session() {
        let plugin = std::sync::Arc::new(Echo::default());
        let (mut host, task) = start(plugin.clone());

        let response = host
            .call(
                method::INITIALIZE,
                serde_json::json!({"protocolVersion": 1, "name": "echo", "config": {}}),
            )
            .await;
        assert!(response.error.is_none());
        assert_eq!(response.id, Some(serde_json::json!(1)));

        let response = host
            .call(
                method::GET_METADATA,
                serde_json::json!({"domain": "example.com", "environment": {"stage": "dev"}}),
            )
            .await;
        let result: MetadataResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.into_metadata().unwrap()["echo"].as_str(), Some("example.com"));

        let response = host
            .call(method::GET_METADATA, serde_json::json!({"domain": "bad.example.com"}))
            .await;
        let result: MetadataResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.into_metadata().unwrap_err().contains("no record"));

        let response = host.call(method::CLOSE, serde_json::json!({})).await;
        assert!(response.error.is_none());

        task.await.unwrap().unwrap();
        assert!(plugin.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_responses() {
        let (mut host, task) = start(std::sync::Arc::new(Echo::default()));

        let response = host
            .call(
                method::INITIALIZE,
                serde_json::json!({"protocolVersion": 1, "name": "echo", "config": {"reject": true}}),
            )
            .await;
        assert_eq!(response.error.unwrap().code, -32005);

        let response = host
            .call(
                method::INITIALIZE,
                serde_json::json!({"protocolVersion": 99, "name": "echo"}),
            )
            .await;
        assert_eq!(response.error.unwrap().code, code::INVALID_PARAMS);

        let response = host.call("describe", serde_json::json!({})).await;
        assert_eq!(response.error.unwrap().code, code::METHOD_NOT_FOUND);

        let response = host.call(method::GET_METADATA, serde_json::json!({"nope": 1})).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, code::INVALID_PARAMS);
        assert_eq!(response.id, Some(serde_json::json!(4)));

        write_frame(&mut host.writer, b"not json").await.unwrap();
        let frame = read_frame(&mut host.reader).await.unwrap().unwrap();
        let response: RpcResponse = serde_json::from_slice(&frame).unwrap();
        assert_eq!(response.error.unwrap().code, code::PARSE_ERROR);

        drop(host);
        task.await.unwrap().unwrap();
    }
}
