//! JSON-RPC + Etherscan-style API back-end (C6).
//!
//! Wraps two remote services behind dependency-injected transports
//! (`RpcTransport`, `TxIndexTransport`) so the sync loop can be driven from
//! an in-memory fake in tests instead of a live endpoint (§1 "Test tooling").

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use jsonrpsee::core::async_trait;
use jsonrpsee::rpc_params;
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::backend::{Backend, BackendKind, EventSink, Log, LogFilter, SyncState};
use crate::chain::ChainParams;
use crate::error::{Result, WalletError};
use crate::storage::{Contract, Store};
use crate::transaction::{sign, RawTransaction, Transaction};

/// Fixed polling cadence resolved in Open Question 3.
const API_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(60);
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// `balanceOf(address)` selector, used to poll tracked ERC-20 contracts
/// (§4.10 `register`) the same way native balance is polled in step 2.
const ERC20_BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

fn erc20_balance_of_calldata(holder: Address) -> Vec<u8> {
    let mut data = ERC20_BALANCE_OF_SELECTOR.to_vec();
    let mut arg = [0u8; 32];
    arg[12..].copy_from_slice(holder.as_slice());
    data.extend_from_slice(&arg);
    data
}

fn parse_balance_reply(reply: &[u8]) -> U256 {
    if reply.len() != 32 {
        return U256::ZERO;
    }
    U256::from_be_slice(reply)
}

/// The JSON-RPC surface the API back-end needs (§4.6). `send_raw_transaction`
/// takes the already-signed RLP; signing itself happens in `ApiBackend::send`
/// so the back-end, not the transport, owns the private key.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn balance(&self, address: Address) -> Result<U256>;
    async fn transaction_count(&self, address: Address) -> Result<u64>;
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256>;
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>>;
    async fn estimate_gas(&self, to: Address, value: U256, data: Vec<u8>) -> Result<u64>;
    async fn get_logs(&self, filter: LogFilter) -> Result<Vec<Log>>;
}

/// One page of the Etherscan-style transaction index.
#[derive(Debug, Clone, Default)]
pub struct TxIndexPage {
    pub transactions: Vec<Transaction>,
    /// `true` once this page is empty — the sync loop's terminal condition
    /// for §4.6 step 4.
    pub is_last: bool,
}

/// The Etherscan-style historical-transaction surface (§4.6).
#[async_trait]
pub trait TxIndexTransport: Send + Sync {
    async fn page(&self, address: Address, from_block: u64) -> Result<TxIndexPage>;
}

struct Inner<R, T> {
    rpc: R,
    tx_index: T,
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    address: Address,
    priv_key: [u8; 32],
    chain: ChainParams,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: Notify,
    refresh: Notify,
    send_lock: Mutex<()>,
    tracked_contracts: Mutex<HashSet<Address>>,
}

/// The API back-end (C6). `Clone` is cheap: it is a handle onto the shared
/// task state behind an `Arc`.
pub struct ApiBackend<R: RpcTransport, T: TxIndexTransport> {
    inner: Arc<Inner<R, T>>,
}

impl<R: RpcTransport, T: TxIndexTransport> Clone for ApiBackend<R, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<R: RpcTransport + 'static, T: TxIndexTransport + 'static> ApiBackend<R, T> {
    pub fn new(
        rpc: R,
        tx_index: T,
        store: Arc<dyn Store>,
        sink: Arc<dyn EventSink>,
        address: Address,
        priv_key: [u8; 32],
        chain: ChainParams,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rpc,
                tx_index,
                store,
                sink,
                address,
                priv_key,
                chain,
                task: Mutex::new(None),
                stop: Notify::new(),
                refresh: Notify::new(),
                send_lock: Mutex::new(()),
                tracked_contracts: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Runs one full pass of the §4.6 sync loop (steps 1-4), then emits
    /// `Synced` (step 5). Returns an error on the first failed step so the
    /// caller can decide whether to retry or back off.
    async fn sync_once(&self) -> Result<()> {
        let height = self.inner.rpc.block_number().await?;
        self.inner.store.set_last_block_height(height)?;
        self.inner.sink.on_last_block_height(height);

        let balance = self.inner.rpc.balance(self.inner.address).await?;
        let changed = self.inner.store.balance(Contract::Native)? != Some(balance);
        self.inner.store.set_balance(Contract::Native, balance, height)?;
        if changed {
            self.inner.sink.on_balance(Contract::Native, balance);
        }

        // Step 3: nonce management. Fetched for its side effect of keeping
        // the account state current; `send` re-fetches it fresh under the
        // send lock rather than trusting this snapshot.
        let _nonce = self.inner.rpc.transaction_count(self.inner.address).await?;

        let tracked: Vec<Address> = self.inner.tracked_contracts.lock().await.iter().copied().collect();
        for contract in tracked {
            let data = erc20_balance_of_calldata(self.inner.address);
            let reply = self.inner.rpc.call(contract, data).await?;
            let contract_balance = parse_balance_reply(&reply);
            let changed = self.inner.store.balance(Contract::Erc20(contract))? != Some(contract_balance);
            self.inner.store.set_balance(Contract::Erc20(contract), contract_balance, height)?;
            if changed {
                self.inner.sink.on_balance(Contract::Erc20(contract), contract_balance);
            }
        }

        let mut from_block = self.inner.store.last_block_height()?.unwrap_or(0);
        loop {
            let page = self.inner.tx_index.page(self.inner.address, from_block).await?;
            if page.transactions.is_empty() {
                break;
            }
            for tx in page.transactions.iter().cloned() {
                self.inner.store.insert_transaction(tx)?;
            }
            self.inner.sink.on_transactions(Contract::Native, page.transactions.clone());
            if page.is_last {
                break;
            }
            from_block = page
                .transactions
                .iter()
                .filter_map(|tx| tx.block_height)
                .max()
                .map(|h| h + 1)
                .unwrap_or(from_block + 1);
        }

        self.inner.sink.on_sync_state(SyncState::Synced);
        Ok(())
    }

    async fn run(self) {
        self.inner.sink.on_sync_state(SyncState::Syncing(None));
        let mut delay = RETRY_BASE;
        loop {
            let outcome = {
                let sync = self.sync_once();
                let stopped = self.inner.stop.notified();
                tokio::pin!(sync);
                tokio::pin!(stopped);
                tokio::select! {
                    result = &mut sync => Some(result),
                    _ = &mut stopped => None,
                }
            };
            match outcome {
                None => return,
                Some(Ok(())) => {
                    delay = RETRY_BASE;
                }
                Some(Err(err)) if err.is_retryable() => {
                    log::warn!("api back-end sync pass failed, retrying in {delay:?}: {err}");
                    self.inner.sink.on_sync_state(SyncState::NotSynced(Some(err.to_string())));
                    if wait_or_stop(&self.inner.stop, jittered(delay)).await.is_none() {
                        return;
                    }
                    delay = (delay * 2).min(RETRY_CAP);
                    continue;
                }
                Some(Err(err)) => {
                    log::error!("api back-end sync pass failed fatally: {err}");
                    self.inner.sink.on_sync_state(SyncState::NotSynced(Some(err.to_string())));
                    return;
                }
            }

            if wait_or_stop_or_refresh(&self.inner.stop, &self.inner.refresh, API_POLL_INTERVAL).await.is_none() {
                return;
            }
        }
    }
}

async fn wait_or_stop(stop: &Notify, delay: Duration) -> Option<()> {
    let wait = tokio::time::sleep(delay);
    tokio::pin!(wait);
    let stopped = stop.notified();
    tokio::pin!(stopped);
    tokio::select! {
        _ = &mut wait => Some(()),
        _ = &mut stopped => None,
    }
}

async fn wait_or_stop_or_refresh(stop: &Notify, refresh: &Notify, delay: Duration) -> Option<()> {
    let wait = tokio::time::sleep(delay);
    tokio::pin!(wait);
    let refreshed = refresh.notified();
    tokio::pin!(refreshed);
    let stopped = stop.notified();
    tokio::pin!(stopped);
    tokio::select! {
        _ = &mut wait => Some(()),
        _ = &mut refreshed => Some(()),
        _ = &mut stopped => None,
    }
}

fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis().max(1) as u64;
    let jittered = rand::thread_rng().gen_range(0..=millis);
    Duration::from_millis(jittered)
}

#[async_trait]
impl<R: RpcTransport + 'static, T: TxIndexTransport + 'static> Backend for ApiBackend<R, T> {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let handle = self.clone();
        *task = Some(tokio::spawn(handle.run()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.inner.task.lock().await.take();
        let Some(handle) = handle else { return Ok(()) };
        self.inner.stop.notify_waiters();
        if tokio::time::timeout(STOP_DEADLINE, handle).await.is_err() {
            log::warn!("api back-end did not stop within {STOP_DEADLINE:?}");
        }
        self.inner.sink.on_sync_state(SyncState::NotSynced(None));
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.inner.refresh.notify_waiters();
        Ok(())
    }

    /// Holds `send_lock` across nonce-fetch + sign + broadcast so two
    /// concurrent `send` calls never race for the same nonce (§5 ordering
    /// guarantee).
    async fn send(&self, raw: RawTransaction) -> Result<Transaction> {
        let _guard = self.inner.send_lock.lock().await;
        let nonce = match raw.nonce {
            Some(nonce) => nonce,
            None => self.inner.rpc.transaction_count(self.inner.address).await?,
        };
        let (tx, signed_rlp) = sign(&raw, nonce, self.inner.chain.network_id, &self.inner.priv_key)?;
        let broadcast_hash = self.inner.rpc.send_raw_transaction(&signed_rlp).await?;
        if broadcast_hash != tx.hash {
            return Err(WalletError::state("node echoed a different transaction hash than the one we signed"));
        }
        self.inner.store.insert_transaction(tx.clone())?;
        self.inner.sink.on_transactions(Contract::Native, vec![tx.clone()]);
        Ok(tx)
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        self.inner.rpc.call(to, data).await
    }

    async fn estimate_gas(&self, to: Address, value: U256, data: Vec<u8>) -> Result<u64> {
        self.inner.rpc.estimate_gas(to, value, data).await
    }

    async fn get_logs(&self, filter: LogFilter) -> Result<Vec<Log>> {
        self.inner.rpc.get_logs(filter).await
    }

    async fn track_contract(&self, contract: Address) -> Result<()> {
        self.inner.tracked_contracts.lock().await.insert(contract);
        Ok(())
    }

    async fn untrack_contract(&self, contract: Address) -> Result<()> {
        self.inner.tracked_contracts.lock().await.remove(&contract);
        Ok(())
    }
}

/// A thin wrapper over `jsonrpsee`'s HTTP client, implementing `RpcTransport`
/// against a real JSON-RPC endpoint.
pub struct HttpRpcTransport {
    client: jsonrpsee::http_client::HttpClient,
}

impl HttpRpcTransport {
    pub fn new(url: &str) -> Result<Self> {
        let client = jsonrpsee::http_client::HttpClientBuilder::default()
            .build(url)
            .map_err(|e| WalletError::transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn block_number(&self) -> Result<u64> {
        let hex: String = request(&self.client, "eth_blockNumber", rpc_params![]).await?;
        parse_quantity(&hex)
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        let hex: String = request(&self.client, "eth_getBalance", rpc_params![address, "latest"]).await?;
        parse_u256(&hex)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        let hex: String = request(&self.client, "eth_getTransactionCount", rpc_params![address, "latest"]).await?;
        parse_quantity(&hex)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let raw_hex = format!("0x{}", hex::encode(raw));
        let hex: String = request(&self.client, "eth_sendRawTransaction", rpc_params![raw_hex]).await?;
        let bytes = hex::decode(hex.trim_start_matches("0x"))
            .map_err(|e| WalletError::protocol(crate::error::DisconnectReason::BadProtocol, e.to_string()))?;
        if bytes.len() != 32 {
            return Err(WalletError::transport("node returned a malformed transaction hash"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(B256::from(out))
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let params = serde_json::json!({ "to": to, "data": format!("0x{}", hex::encode(&data)) });
        let hex: String = request(&self.client, "eth_call", rpc_params![params, "latest"]).await?;
        hex::decode(hex.trim_start_matches("0x")).map_err(|e| WalletError::transport(e.to_string()))
    }

    async fn estimate_gas(&self, to: Address, value: U256, data: Vec<u8>) -> Result<u64> {
        let params = serde_json::json!({
            "to": to,
            "value": format!("0x{value:x}"),
            "data": format!("0x{}", hex::encode(&data)),
        });
        let hex: String = request(&self.client, "eth_estimateGas", rpc_params![params]).await?;
        parse_quantity(&hex)
    }

    async fn get_logs(&self, filter: LogFilter) -> Result<Vec<Log>> {
        let _ = filter;
        // Decoding the JSON-RPC log array into `Log` needs a schema this
        // crate does not otherwise carry; left for a host to extend.
        Err(WalletError::unsupported("get_logs is not wired up for the HTTP transport yet"))
    }
}

async fn request<P, O>(client: &jsonrpsee::http_client::HttpClient, method: &str, params: P) -> Result<O>
where
    P: jsonrpsee::core::traits::ToRpcParams + Send,
    O: serde::de::DeserializeOwned,
{
    use jsonrpsee::core::client::ClientT;
    client.request(method, params).await.map_err(|e| WalletError::transport(e.to_string()))
}

fn parse_quantity(hex: &str) -> Result<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16).map_err(|e| WalletError::transport(e.to_string()))
}

fn parse_u256(hex: &str) -> Result<U256> {
    U256::from_str_radix(hex.trim_start_matches("0x"), 16).map_err(|e| WalletError::transport(e.to_string()))
}

/// An Etherscan-style tx-index client over `reqwest`; the crate's own
/// Cargo.toml comment already earmarks this dependency for exactly this
/// role.
pub struct EtherscanTxIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EtherscanTxIndex {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl TxIndexTransport for EtherscanTxIndex {
    async fn page(&self, address: Address, from_block: u64) -> Result<TxIndexPage> {
        let url = format!(
            "{}/api?module=account&action=txlist&address={address}&startblock={from_block}&sort=asc&apikey={}",
            self.base_url, self.api_key
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| WalletError::transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| WalletError::transport(e.to_string()))?;
        let body: EtherscanTxListResponse =
            response.json().await.map_err(|e| WalletError::transport(e.to_string()))?;
        if body.status != "1" && !body.result.is_empty() {
            return Err(WalletError::transport(format!("etherscan error: {}", body.message)));
        }
        let transactions = body.result.iter().map(EtherscanTx::into_transaction).collect::<Result<Vec<_>>>()?;
        Ok(TxIndexPage { is_last: transactions.is_empty(), transactions })
    }
}

#[derive(serde::Deserialize)]
struct EtherscanTxListResponse {
    status: String,
    message: String,
    result: Vec<EtherscanTx>,
}

#[derive(serde::Deserialize)]
struct EtherscanTx {
    hash: String,
    nonce: String,
    from: String,
    to: String,
    value: String,
    #[serde(rename = "gasPrice")]
    gas_price: String,
    gas: String,
    input: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "timeStamp")]
    timestamp: String,
}

impl EtherscanTx {
    fn into_transaction(&self) -> Result<Transaction> {
        let parse_hex32 = |s: &str| -> Result<[u8; 32]> {
            let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| WalletError::transport(e.to_string()))?;
            if bytes.len() != 32 {
                return Err(WalletError::transport("expected a 32-byte hex field"));
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            Ok(out)
        };
        let parse_address = |s: &str| -> Result<Address> { crate::address::validate_address(s).map_err(WalletError::from) };
        let parse_decimal =
            |s: &str| -> Result<u64> { s.parse().map_err(|_| WalletError::transport("expected a decimal integer field")) };

        Ok(Transaction {
            hash: B256::from(parse_hex32(&self.hash)?),
            nonce: parse_decimal(&self.nonce)?,
            from: parse_address(&self.from)?,
            to: parse_address(&self.to)?,
            value: U256::from_str_radix(&self.value, 10).map_err(|e| WalletError::transport(e.to_string()))?,
            gas_price: parse_decimal(&self.gas_price)?,
            gas_limit: parse_decimal(&self.gas)?,
            input: hex::decode(self.input.trim_start_matches("0x")).map_err(|e| WalletError::transport(e.to_string()))?,
            timestamp: parse_decimal(&self.timestamp)? as i64,
            block_height: Some(parse_decimal(&self.block_number)?),
        })
    }
}
