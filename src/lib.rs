//! A client-side Ethereum wallet kit: account sync over either a JSON-RPC
//! node (and an Etherscan-style transaction index) or a devp2p/LES light
//! client, transaction building and signing, and a Uniswap V2 trade
//! planner — with no bundled persistence, configuration loader, or UI.
//! Those are host concerns; this crate exposes the seams.

pub mod address;
pub mod backend;
pub mod chain;
pub mod controller;
pub mod crypto;
pub mod devp2p;
pub mod error;
pub mod rlp;
pub mod rlpx;
pub mod storage;
pub mod transaction;
pub mod uniswap;

mod api_backend;
mod spv_backend;

pub use api_backend::{ApiBackend, EtherscanTxIndex, HttpRpcTransport, RpcTransport, TxIndexPage, TxIndexTransport};
pub use backend::{Backend, BackendKind, EventSink, Log, LogFilter, SyncState};
pub use chain::ChainParams;
pub use controller::{ContractListener, FeeKind, PreparedSink, SyncController};
pub use error::{Result, WalletError};
pub use spv_backend::SpvBackend;
pub use storage::{Contract, MemoryStore, Store, TransactionQuery};
