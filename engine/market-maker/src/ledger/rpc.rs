//! JSON-RPC ledger client for Graphene-style nodes.
//!
//! Reads go to the node's `database` API through `call`. Broadcasts go to a
//! wallet RPC endpoint that builds, signs and broadcasts the transaction.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use super::{Ledger, Wallet};
use crate::error::{MarketMakerError, Result};
use crate::models::{Account, Asset, AssetAmount, BitAssetData, LimitOrder, ObjectId, Operation};

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Ledger backed by a node RPC endpoint and a wallet RPC endpoint
pub struct RpcLedger {
    client: Client,
    node_url: Url,
    wallet_url: Url,
    request_id: AtomicU64,
    keys_imported: OnceCell<()>,
    dry_run: bool,
}

impl RpcLedger {
    pub fn new(node_url: &str, wallet_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            node_url: Url::parse(node_url)?,
            wallet_url: Url::parse(wallet_url)?,
            request_id: AtomicU64::new(1),
            keys_imported: OnceCell::new(),
            dry_run: false,
        })
    }

    /// Log broadcasts instead of sending them; reads still go to the node
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn request<T: DeserializeOwned>(&self, url: &Url, method: &str, params: Value) -> Result<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let response: RpcResponse =
            self.client.post(url.clone()).json(&body).send().await?.error_for_status()?.json().await?;

        if let Some(error) = response.error {
            return Err(MarketMakerError::Rpc { code: error.code, message: error.message });
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }

    async fn database<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        debug!("database.{}", method);
        self.request(&self.node_url, "call", json!(["database", method, params])).await
    }

    async fn wallet<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        debug!("wallet.{}", method);
        self.request(&self.wallet_url, method, params).await
    }

    async fn import_keys(&self, wallet: &Wallet) -> Result<()> {
        self.keys_imported
            .get_or_try_init(|| async {
                for key in wallet.keys() {
                    let imported: bool = self.wallet("import_key", json!([wallet.account(), key])).await?;
                    if !imported {
                        return Err(MarketMakerError::Ledger(format!(
                            "wallet rejected a key for account {}",
                            wallet.account()
                        )));
                    }
                }
                info!("Imported {} keys for account {}", wallet.keys().len(), wallet.account());
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn build_and_sign(&self, handle: u64, fee_asset: ObjectId, operations: &[Operation]) -> Result<()> {
        for operation in operations {
            let _: Value = self
                .wallet("add_operation_to_builder_transaction", json!([handle, operation.to_wire()]))
                .await?;
        }
        let _: Value = self.wallet("set_fees_on_builder_transaction", json!([handle, fee_asset])).await?;
        let _: Value = self.wallet("sign_builder_transaction", json!([handle, true])).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Ledger for RpcLedger {
    async fn get_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.database("get_account_by_name", json!([name])).await
    }

    async fn lookup_asset_symbols(&self, symbols: &[String]) -> Result<Vec<Option<Asset>>> {
        self.database("lookup_asset_symbols", json!([symbols])).await
    }

    async fn get_account_balances(
        &self,
        account: ObjectId,
        assets: &[ObjectId],
    ) -> Result<Vec<AssetAmount>> {
        self.database("get_account_balances", json!([account, assets])).await
    }

    async fn get_limit_orders(
        &self,
        base: ObjectId,
        quote: ObjectId,
        limit: u32,
    ) -> Result<Vec<LimitOrder>> {
        self.database("get_limit_orders", json!([base, quote, limit])).await
    }

    async fn get_bitasset_data(&self, id: ObjectId) -> Result<BitAssetData> {
        let objects: Vec<Option<BitAssetData>> = self.database("get_objects", json!([[id]])).await?;
        objects
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| MarketMakerError::Ledger(format!("object {} not found", id)))
    }

    async fn sign_and_broadcast(
        &self,
        wallet: &Wallet,
        fee_asset: ObjectId,
        operations: &[Operation],
    ) -> Result<()> {
        if self.dry_run {
            info!("Dry run: discarding {} operations for {}", operations.len(), wallet.account());
            for operation in operations {
                debug!("{}", operation.to_wire());
            }
            return Ok(());
        }

        self.import_keys(wallet).await?;

        let handle: u64 = self.wallet("begin_builder_transaction", json!([])).await?;
        let result = self.build_and_sign(handle, fee_asset, operations).await;

        // the wallet keeps a builder handle until it is removed, signed or not
        if let Err(e) = self.wallet::<Value>("remove_builder_transaction", json!([handle])).await {
            warn!("Failed to remove builder transaction {}: {}", handle, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LimitOrderCancelOperation, CORE_ASSET};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_rejects_invalid_urls() {
        assert!(RpcLedger::new("not a url", "http://127.0.0.1:8093", Duration::from_secs(1)).is_err());
        assert!(RpcLedger::new("http://127.0.0.1:8090", "http://127.0.0.1:8093", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_rpc_response_parsing() {
        let ok: RpcResponse = serde_json::from_str(r#"{"id":1,"jsonrpc":"2.0","result":[null]}"#).unwrap();
        assert!(ok.error.is_none());
        assert_eq!(ok.result, Some(json!([null])));

        let failed: RpcResponse = serde_json::from_str(
            r#"{"id":2,"error":{"code":1,"message":"Assert Exception: account not found"}}"#,
        )
        .unwrap();
        assert_eq!(failed.error.unwrap().code, 1);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_contact_wallet() {
        let ledger = RpcLedger::new("http://127.0.0.1:1", "http://127.0.0.1:1", Duration::from_millis(100))
            .unwrap()
            .with_dry_run(true);
        let wallet = Wallet::new("maker", vec!["key".to_string()]).unwrap();
        let cancel = Operation::LimitOrderCancel(LimitOrderCancelOperation {
            order: ObjectId::new(1, 7, 42),
            fee_paying_account: ObjectId::new(1, 2, 100),
        });

        assert!(ledger.sign_and_broadcast(&wallet, CORE_ASSET, &[cancel]).await.is_ok());
    }

    /// Wallet endpoint answering every JSON-RPC call over HTTP/1.1, recording method names.
    /// `failing` makes that one method return an RPC error.
    async fn stub_wallet(failing: Option<&'static str>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let methods = Arc::new(Mutex::new(Vec::new()));

        let seen = methods.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let request = read_request(&mut stream).await;
                if request.is_empty() {
                    continue;
                }
                let body: Value = serde_json::from_slice(&request).unwrap();
                let method = body["method"].as_str().unwrap_or_default().to_string();
                seen.lock().push(method.clone());

                let reply = if failing == Some(method.as_str()) {
                    json!({ "id": body["id"], "error": { "code": 1, "message": "rejected" } })
                } else {
                    let result = match method.as_str() {
                        "begin_builder_transaction" => json!(7),
                        "import_key" => json!(true),
                        _ => Value::Null,
                    };
                    json!({ "id": body["id"], "jsonrpc": "2.0", "result": result })
                };
                let reply = reply.to_string();

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    reply.len(),
                    reply
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, methods)
    }

    /// Body of one HTTP request, read up to its Content-Length
    async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return Vec::new();
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return buf[end + 4..end + 4 + length].to_vec();
                }
            }
        }
    }

    fn cancel_operation() -> Operation {
        Operation::LimitOrderCancel(LimitOrderCancelOperation {
            order: ObjectId::new(1, 7, 42),
            fee_paying_account: ObjectId::new(1, 2, 100),
        })
    }

    fn count(methods: &[String], name: &str) -> usize {
        methods.iter().filter(|m| m.as_str() == name).count()
    }

    #[tokio::test]
    async fn test_broadcast_removes_builder_transaction() {
        let (url, methods) = stub_wallet(None).await;
        let ledger = RpcLedger::new(&url, &url, Duration::from_secs(5)).unwrap();
        let wallet = Wallet::new("maker", vec!["key".to_string()]).unwrap();

        ledger.sign_and_broadcast(&wallet, CORE_ASSET, &[cancel_operation()]).await.unwrap();
        ledger.sign_and_broadcast(&wallet, CORE_ASSET, &[cancel_operation()]).await.unwrap();

        let methods = methods.lock().clone();
        assert_eq!(count(&methods, "import_key"), 1);
        assert_eq!(count(&methods, "begin_builder_transaction"), 2);
        assert_eq!(count(&methods, "remove_builder_transaction"), 2);
        assert_eq!(
            &methods[..6],
            [
                "import_key",
                "begin_builder_transaction",
                "add_operation_to_builder_transaction",
                "set_fees_on_builder_transaction",
                "sign_builder_transaction",
                "remove_builder_transaction",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_sign_removes_builder_transaction() {
        let (url, methods) = stub_wallet(Some("sign_builder_transaction")).await;
        let ledger = RpcLedger::new(&url, &url, Duration::from_secs(5)).unwrap();
        let wallet = Wallet::new("maker", vec!["key".to_string()]).unwrap();

        let result = ledger.sign_and_broadcast(&wallet, CORE_ASSET, &[cancel_operation()]).await;
        assert!(matches!(result, Err(MarketMakerError::Rpc { code: 1, .. })));

        let methods = methods.lock().clone();
        assert_eq!(count(&methods, "begin_builder_transaction"), 1);
        assert_eq!(count(&methods, "remove_builder_transaction"), 1);
        assert_eq!(methods.last().map(String::as_str), Some("remove_builder_transaction"));
    }
}
