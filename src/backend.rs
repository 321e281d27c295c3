//! Shared back-end contract (Design note "Polymorphism over back-ends"):
//! the API back-end (C6) and the SPV back-end (C9) are modeled as two
//! implementations of one `Backend` trait rather than a class hierarchy,
//! with `call`/`estimate_gas`/`get_logs` as capabilities an implementation
//! may decline with `WalletError::Unsupported`.

use alloy_primitives::{Address, U256};
use jsonrpsee::core::async_trait;

use crate::error::Result;
use crate::storage::Contract;
use crate::transaction::{RawTransaction, Transaction};

/// `{ Synced, NotSynced, Syncing(progress) }` (§3 "SyncState"). `NotSynced`
/// carries the reason so the controller can surface it without re-deriving
/// it from the last error.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Synced,
    NotSynced(Option<String>),
    Syncing(Option<f64>),
}

/// The event kinds a back-end pushes into its owning controller (§2
/// "Control flow"). Constructed as a function-style sink rather than a
/// back-reference to the controller (Design note "Cycles between
/// controller and back-end") so the back-end never needs to know about the
/// controller that owns it.
pub trait EventSink: Send + Sync {
    fn on_last_block_height(&self, height: u64);
    fn on_sync_state(&self, state: SyncState);
    fn on_balance(&self, contract: Contract, balance: U256);
    fn on_transactions(&self, contract: Contract, transactions: Vec<Transaction>);
}

/// Which kind of back-end is live. Exposed so the controller can report it
/// and so `fee()` can pick the right gas-limit default without depending on
/// the concrete back-end type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Api,
    Spv,
}

/// An in-flight log filter, as accepted by `get_logs` on back-ends that
/// support it.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub address: Option<Address>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub topics: Vec<[u8; 32]>,
}

/// A single decoded log entry.
#[derive(Debug, Clone)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
    pub block_height: u64,
}

/// The capability set every back-end implements (§9 "Polymorphism over
/// back-ends"). `start`/`stop` govern the back-end's own sync task;
/// `send` and the read-only queries are always available; `call`,
/// `get_logs`, and `estimate_gas` are optional per back-end.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Begins the sync loop. Idempotent: calling `start` while already
    /// running is a no-op.
    async fn start(&self) -> Result<()>;

    /// Stops the sync loop per the cancellation contract in §5: closes
    /// transport, persists the last acknowledged height, and transitions
    /// to `NotSynced` within the deadline.
    async fn stop(&self) -> Result<()>;

    /// Forces an out-of-cycle refresh of height/balance/transactions.
    async fn refresh(&self) -> Result<()>;

    /// Assigns a nonce to `raw`, signs it, broadcasts it, and returns the
    /// resulting `Transaction` once accepted by the back-end (not
    /// necessarily mined).
    async fn send(&self, raw: RawTransaction) -> Result<Transaction>;

    /// `eth_call`-equivalent. `Unsupported` on SPV (§4.9).
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let _ = (to, data);
        Err(crate::error::WalletError::unsupported("call is not supported by this back-end"))
    }

    /// `eth_estimateGas`-equivalent. `Unsupported` on SPV (§4.9).
    async fn estimate_gas(&self, to: Address, value: U256, data: Vec<u8>) -> Result<u64> {
        let _ = (to, value, data);
        Err(crate::error::WalletError::unsupported(
            "estimateGas is not supported by this back-end",
        ))
    }

    /// `eth_getLogs`-equivalent. `Unsupported` on SPV (§4.9).
    async fn get_logs(&self, filter: LogFilter) -> Result<Vec<Log>> {
        let _ = filter;
        Err(crate::error::WalletError::unsupported("getLogs is not supported by this back-end"))
    }

    /// `eth_getStorageAt`-equivalent. Never supported on SPV: no storage
    /// proof format is defined, so this stays `Unsupported` rather than
    /// guessing at one.
    async fn get_storage_at(&self, address: Address, key: [u8; 32]) -> Result<[u8; 32]> {
        let _ = (address, key);
        Err(crate::error::WalletError::unsupported(
            "getStorageAt is not supported by this back-end",
        ))
    }

    /// Begins watching `contract`'s balance/transactions as an additional
    /// per-asset sync state (§2 "Control flow"), so the controller's
    /// `register` (§4.10) starts receiving `Contract::Erc20(contract)`
    /// events. SPV declines: ERC-20 balance requires a storage proof, which
    /// Open Question #2 leaves unimplemented.
    async fn track_contract(&self, contract: Address) -> Result<()> {
        let _ = contract;
        Err(crate::error::WalletError::unsupported(
            "tracking additional contracts is not supported by this back-end",
        ))
    }

    /// Stops watching `contract`. A no-op if it was never tracked.
    async fn untrack_contract(&self, contract: Address) -> Result<()> {
        let _ = contract;
        Ok(())
    }
}
