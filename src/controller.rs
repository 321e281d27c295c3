//! Sync controller (C10): the façade a host application actually talks to.
//! Owns one back-end (chosen at construction), aggregates per-(account,
//! contract) state, and fans out the four event kinds the back-end pushes
//! (`lastBlockHeight`, `syncState`, `balance`, `transactions`) to subscribers
//! as explicit streams (Design note "Global RxJava subjects") rather than a
//! listener-pointer back into the controller (Design note "Cycles between
//! controller and back-end").

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::address::validate_address;
use crate::backend::{Backend, BackendKind, EventSink, SyncState};
use crate::error::{Result, WalletError};
use crate::storage::{Contract, Store, TransactionQuery};
use crate::transaction::{RawTransaction, Transaction};

/// Bound on the `transactions` channel (Design note "Global RxJava
/// subjects": buffer with a configurable bound, default 256).
const TRANSACTIONS_CHANNEL_CAPACITY: usize = 256;

/// Gas-limit defaults `fee()` multiplies by (§4.10).
const NATIVE_GAS_LIMIT: u64 = 21_000;
const ERC20_GAS_LIMIT: u64 = 100_000;

/// Which gas-limit default `fee()` should use; `Native` for a plain ETH
/// transfer, `Erc20` for any transaction touching a token contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeKind {
    Native,
    Erc20,
}

impl FeeKind {
    fn gas_limit(self) -> u64 {
        match self {
            FeeKind::Native => NATIVE_GAS_LIMIT,
            FeeKind::Erc20 => ERC20_GAS_LIMIT,
        }
    }
}

/// A caller-supplied hook invoked whenever a registered contract's balance
/// or transactions change, in addition to the contract's entry in the
/// shared `balanceStream`/`transactionsStream`. A plain synchronous
/// callback dispatched on the controller's own task, no implicit queuing
/// beyond what the bounded channel already does.
pub trait ContractListener: Send + Sync {
    fn on_balance(&self, contract: Address, balance: U256);
    fn on_transactions(&self, contract: Address, transactions: Vec<Transaction>);
}

struct Registry {
    listeners: SyncMutex<HashMap<Address, Arc<dyn ContractListener>>>,
}

impl Registry {
    fn new() -> Self {
        Self { listeners: SyncMutex::new(HashMap::new()) }
    }
}

/// The sink half handed to a back-end's constructor. Produced by
/// `SyncController::prepare_sink()` before the back-end exists, so the
/// construction order is sink → back-end → controller, never the reverse
/// (Design note "Cycles between controller and back-end").
pub struct PreparedSink {
    sink: Arc<ControllerSink>,
    last_block_height_rx: watch::Receiver<Option<u64>>,
    sync_state_rx: watch::Receiver<SyncState>,
    balance_rx: watch::Receiver<Option<U256>>,
    transactions_rx: mpsc::Receiver<Vec<Transaction>>,
}

impl PreparedSink {
    /// The `Arc<dyn EventSink>` to pass to `ApiBackend::new` / `SpvBackend::new`.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }
}

struct ControllerSink {
    registry: Arc<Registry>,
    last_block_height_tx: watch::Sender<Option<u64>>,
    sync_state_tx: watch::Sender<SyncState>,
    balance_tx: watch::Sender<Option<U256>>,
    // Unbounded relay into the single drain task (below), which forwards
    // sequentially into the bounded public channel. `EventSink::on_transactions`
    // is synchronous and must not block the back-end task on a full channel;
    // only the drain task ever blocks, via `.send().await`, which is where the
    // real backpressure lives.
    transactions_relay: mpsc::UnboundedSender<Vec<Transaction>>,
}

impl EventSink for ControllerSink {
    fn on_last_block_height(&self, height: u64) {
        self.last_block_height_tx.send_if_modified(|current| {
            let changed = *current != Some(height);
            if changed {
                *current = Some(height);
            }
            changed
        });
    }

    fn on_sync_state(&self, state: SyncState) {
        self.sync_state_tx.send_if_modified(|current| {
            let changed = *current != state;
            if changed {
                *current = state;
            }
            changed
        });
    }

    fn on_balance(&self, contract: Contract, balance: U256) {
        match contract {
            Contract::Native => {
                self.balance_tx.send_if_modified(|current| {
                    let changed = *current != Some(balance);
                    if changed {
                        *current = Some(balance);
                    }
                    changed
                });
            }
            Contract::Erc20(address) => {
                if let Some(listener) = self.registry.listeners.lock().get(&address) {
                    listener.on_balance(address, balance);
                }
            }
        }
    }

    fn on_transactions(&self, contract: Contract, transactions: Vec<Transaction>) {
        if transactions.is_empty() {
            return;
        }
        if let Contract::Erc20(address) = contract {
            if let Some(listener) = self.registry.listeners.lock().get(&address) {
                listener.on_transactions(address, transactions.clone());
            }
        }
        let _ = self.transactions_relay.send(transactions);
    }
}

/// The sync controller (C10). `Clone` is a handle onto shared state, same
/// role as the back-ends' own `Clone`.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    backend: Arc<dyn Backend>,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    address: Address,
    last_block_height_rx: watch::Receiver<Option<u64>>,
    sync_state_rx: watch::Receiver<SyncState>,
    balance_rx: watch::Receiver<Option<U256>>,
    transactions_rx: AsyncMutex<mpsc::Receiver<Vec<Transaction>>>,
}

impl SyncController {
    /// First half of construction: builds the event sink and its
    /// subscriber-side receivers. Hand `PreparedSink::sink()` to the
    /// back-end's constructor, then finish with `SyncController::new`.
    pub fn prepare_sink() -> PreparedSink {
        let registry = Arc::new(Registry::new());
        let (last_block_height_tx, last_block_height_rx) = watch::channel(None);
        let (sync_state_tx, sync_state_rx) = watch::channel(SyncState::NotSynced(None));
        let (balance_tx, balance_rx) = watch::channel(None);
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<Vec<Transaction>>();
        let (public_tx, transactions_rx) = mpsc::channel(TRANSACTIONS_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(batch) = relay_rx.recv().await {
                if public_tx.send(batch).await.is_err() {
                    return;
                }
            }
        });

        let sink = Arc::new(ControllerSink {
            registry,
            last_block_height_tx,
            sync_state_tx,
            balance_tx,
            transactions_relay: relay_tx,
        });

        PreparedSink { sink, last_block_height_rx, sync_state_rx, balance_rx, transactions_rx }
    }

    /// Second half of construction, once the back-end exists and has been
    /// handed `prepared.sink()`.
    pub fn new(backend: Arc<dyn Backend>, prepared: PreparedSink, store: Arc<dyn Store>, address: Address) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                backend,
                store,
                registry: prepared.sink.registry.clone(),
                address,
                last_block_height_rx: prepared.last_block_height_rx,
                sync_state_rx: prepared.sync_state_rx,
                balance_rx: prepared.balance_rx,
                transactions_rx: AsyncMutex::new(prepared.transactions_rx),
            }),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.backend.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.inner.backend.stop().await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.inner.backend.refresh().await
    }

    /// `stop()` + wipe the store (§5 "Cancellation").
    pub async fn clear(&self) -> Result<()> {
        self.inner.backend.stop().await?;
        self.inner.store.clear()?;
        Ok(())
    }

    pub fn receive_address(&self) -> Address {
        self.inner.address
    }

    pub fn balance(&self) -> Result<Option<U256>> {
        self.inner.store.balance(Contract::Native)
    }

    pub fn last_block_height(&self) -> Result<Option<u64>> {
        self.inner.store.last_block_height()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.sync_state_rx.borrow().clone()
    }

    pub fn validate_address(&self, input: &str) -> Result<Address> {
        validate_address(input).map_err(WalletError::from)
    }

    /// `fee(gasPrice) = gasPrice · gasLimitFor(kind)` (§4.10).
    pub fn fee(&self, gas_price: u64, kind: FeeKind) -> U256 {
        U256::from(gas_price) * U256::from(kind.gas_limit())
    }

    pub async fn transactions(&self, from_hash: Option<alloy_primitives::B256>, limit: Option<usize>) -> Result<Vec<Transaction>> {
        self.inner.store.transactions(&TransactionQuery { from_hash, limit, contract: None })
    }

    pub async fn send(&self, raw: RawTransaction) -> Result<Transaction> {
        self.inner.backend.send(raw).await
    }

    /// Subscribe `listener` to `contract`'s balance/transaction updates.
    /// Idempotent: re-registering an existing contract is a no-op and does
    /// not overwrite its listener (§4.10).
    pub async fn register(&self, contract: Address, listener: Arc<dyn ContractListener>) -> Result<()> {
        let is_new = {
            let mut listeners = self.inner.registry.listeners.lock();
            if listeners.contains_key(&contract) {
                false
            } else {
                listeners.insert(contract, listener);
                true
            }
        };
        if is_new {
            self.inner.backend.track_contract(contract).await?;
        }
        Ok(())
    }

    pub async fn unregister(&self, contract: Address) -> Result<()> {
        self.inner.registry.listeners.lock().remove(&contract);
        self.inner.backend.untrack_contract(contract).await
    }

    /// Latest-value-only feed, equality-gated at the source (Design note
    /// "Global RxJava subjects").
    pub fn last_block_height_stream(&self) -> watch::Receiver<Option<u64>> {
        self.inner.last_block_height_rx.clone()
    }

    pub fn sync_state_stream(&self) -> watch::Receiver<SyncState> {
        self.inner.sync_state_rx.clone()
    }

    pub fn balance_stream(&self) -> watch::Receiver<Option<U256>> {
        self.inner.balance_rx.clone()
    }

    /// Single-consumer, backpressured (never dropped) transaction batches.
    /// Unlike the other three streams this cannot be cloned for fan-out to
    /// multiple subscribers — callers that need fan-out should relay it
    /// themselves.
    pub async fn next_transaction_batch(&self) -> Option<Vec<Transaction>> {
        self.inner.transactions_rx.lock().recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::core::async_trait;

    struct FakeBackend {
        kind: BackendKind,
        tracked: SyncMutex<Vec<Address>>,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn refresh(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, raw: RawTransaction) -> Result<Transaction> {
            Ok(Transaction {
                hash: Default::default(),
                nonce: 0,
                from: Address::ZERO,
                to: raw.to,
                value: raw.value,
                gas_price: raw.gas_price,
                gas_limit: raw.gas_limit,
                input: raw.data,
                timestamp: 0,
                block_height: None,
            })
        }
        async fn track_contract(&self, contract: Address) -> Result<()> {
            self.tracked.lock().push(contract);
            Ok(())
        }
    }

    fn controller_with(backend: Arc<FakeBackend>) -> SyncController {
        let prepared = SyncController::prepare_sink();
        let sink = prepared.sink();
        // The fake back-end never calls the sink in these tests; it only
        // needs to exist to satisfy `prepare_sink`'s ordering contract.
        let _ = sink;
        let store: Arc<dyn Store> = Arc::new(crate::storage::MemoryStore::new());
        SyncController::new(backend, prepared, store, Address::ZERO)
    }

    #[tokio::test]
    async fn fee_uses_the_right_gas_limit_default() {
        let backend = Arc::new(FakeBackend { kind: BackendKind::Api, tracked: SyncMutex::new(Vec::new()) });
        let controller = controller_with(backend);
        assert_eq!(controller.fee(20, FeeKind::Native), U256::from(20u64 * 21_000));
        assert_eq!(controller.fee(20, FeeKind::Erc20), U256::from(20u64 * 100_000));
    }

    #[tokio::test]
    async fn registering_the_same_contract_twice_tracks_it_once() {
        struct NoopListener;
        impl ContractListener for NoopListener {
            fn on_balance(&self, _contract: Address, _balance: U256) {}
            fn on_transactions(&self, _contract: Address, _transactions: Vec<Transaction>) {}
        }

        let backend = Arc::new(FakeBackend { kind: BackendKind::Api, tracked: SyncMutex::new(Vec::new()) });
        let controller = controller_with(backend.clone());
        let token = Address::repeat_byte(0x42);

        controller.register(token, Arc::new(NoopListener)).await.unwrap();
        controller.register(token, Arc::new(NoopListener)).await.unwrap();

        assert_eq!(backend.tracked.lock().len(), 1, "re-registering an existing contract must be a no-op");
    }

    #[tokio::test]
    async fn unregister_stops_tracking_and_drops_listener() {
        struct NoopListener;
        impl ContractListener for NoopListener {
            fn on_balance(&self, _contract: Address, _balance: U256) {}
            fn on_transactions(&self, _contract: Address, _transactions: Vec<Transaction>) {}
        }

        let backend = Arc::new(FakeBackend { kind: BackendKind::Spv, tracked: SyncMutex::new(Vec::new()) });
        let controller = controller_with(backend);
        let token = Address::repeat_byte(0x7);
        controller.register(token, Arc::new(NoopListener)).await.unwrap();

        controller.unregister(token).await.unwrap();
        assert!(controller.inner.registry.listeners.lock().get(&token).is_none());
    }

    #[tokio::test]
    async fn last_block_height_is_only_emitted_when_changed() {
        let backend = Arc::new(FakeBackend { kind: BackendKind::Api, tracked: SyncMutex::new(Vec::new()) });
        let prepared = SyncController::prepare_sink();
        let sink = prepared.sink();
        let mut stream = {
            let store: Arc<dyn Store> = Arc::new(crate::storage::MemoryStore::new());
            let controller = SyncController::new(backend, prepared, store, Address::ZERO);
            controller.last_block_height_stream()
        };

        sink.on_last_block_height(10);
        stream.changed().await.unwrap();
        assert_eq!(*stream.borrow(), Some(10));

        sink.on_last_block_height(10);
        sink.on_last_block_height(11);
        stream.changed().await.unwrap();
        assert_eq!(*stream.borrow(), Some(11));
    }

    #[tokio::test]
    async fn send_round_trips_through_the_backend() {
        let backend = Arc::new(FakeBackend { kind: BackendKind::Api, tracked: SyncMutex::new(Vec::new()) });
        let controller = controller_with(backend);
        let raw = crate::transaction::build(1, 21_000, Address::repeat_byte(0x9), U256::from(5), Vec::new());
        let tx = controller.send(raw).await.unwrap();
        assert_eq!(tx.value, U256::from(5));
        assert_eq!(tx.to, Address::repeat_byte(0x9));
    }
}
