//! Storage contract (C5): the key-value contract the controller and both
//! back-ends read and write through, plus an in-memory reference
//! implementation so the crate is usable without a host-supplied database.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use alloy_primitives::{Address, B256, U256};

use crate::chain::{AccountState, BlockHeader};
use crate::error::Result;
use crate::transaction::Transaction;

/// Which balance a value is tracked under: the chain's native asset, or a
/// specific ERC-20 contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contract {
    Native,
    Erc20(Address),
}

/// A page of the transaction log, oldest constraint applied, newest-first.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    /// Only transactions strictly older than this hash (exclusive paging
    /// cursor), newest-first.
    pub from_hash: Option<B256>,
    pub limit: Option<usize>,
    pub contract: Option<Contract>,
}

/// The storage contract (C5). Implementations must make reads consistent
/// with writes that preceded them on the same thread; `clear()` must be
/// total (every method below observes empty/`None` state afterwards).
pub trait Store: Send + Sync {
    fn last_block_height(&self) -> Result<Option<u64>>;
    fn set_last_block_height(&self, height: u64) -> Result<()>;

    fn balance(&self, contract: Contract) -> Result<Option<U256>>;
    /// I3: a balance attributed to `height` must never overwrite one
    /// recorded for a greater height. Implementations enforce this, not
    /// callers.
    fn set_balance(&self, contract: Contract, balance: U256, height: u64) -> Result<()>;

    fn insert_transaction(&self, tx: Transaction) -> Result<()>;
    /// Newest-first by `(blockHeight desc, nonce desc)`, per C5.
    fn transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>>;

    /// SPV only: verified headers by hash.
    fn header_by_hash(&self, hash: &B256) -> Result<Option<BlockHeader>>;
    /// SPV only: the verified header at a given height, via the secondary
    /// index.
    fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>>;
    fn insert_header(&self, header: BlockHeader) -> Result<()>;

    fn account_state(&self) -> Result<Option<AccountState>>;
    fn set_account_state(&self, state: AccountState) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// An in-memory `Store`, the reference implementation used by tests and by
/// any deployment that does not need durability across restarts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    last_block_height: Option<u64>,
    balances: HashMap<Contract, (U256, u64)>,
    transactions: Vec<Transaction>,
    headers_by_hash: HashMap<B256, BlockHeader>,
    headers_by_number: HashMap<u64, B256>,
    account_state: Option<AccountState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn last_block_height(&self) -> Result<Option<u64>> {
        Ok(self.inner.read().unwrap().last_block_height)
    }

    fn set_last_block_height(&self, height: u64) -> Result<()> {
        self.inner.write().unwrap().last_block_height = Some(height);
        Ok(())
    }

    fn balance(&self, contract: Contract) -> Result<Option<U256>> {
        Ok(self.inner.read().unwrap().balances.get(&contract).map(|(b, _)| *b))
    }

    fn set_balance(&self, contract: Contract, balance: U256, height: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let should_write = match inner.balances.get(&contract) {
            Some((_, existing_height)) => height >= *existing_height,
            None => true,
        };
        if should_write {
            inner.balances.insert(contract, (balance, height));
        } else {
            log::debug!(
                "ignoring stale balance for height {height} (have {:?})",
                inner.balances.get(&contract).map(|(_, h)| h)
            );
        }
        Ok(())
    }

    fn insert_transaction(&self, tx: Transaction) -> Result<()> {
        self.inner.write().unwrap().transactions.push(tx);
        Ok(())
    }

    fn transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>> {
        let inner = self.inner.read().unwrap();
        let mut matching: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|tx| match query.contract {
                None => true,
                Some(Contract::Native) => true,
                Some(Contract::Erc20(addr)) => tx.to == addr || tx.from == addr,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (b.block_height.unwrap_or(0), b.nonce).cmp(&(a.block_height.unwrap_or(0), a.nonce))
        });
        if let Some(cursor) = query.from_hash {
            if let Some(pos) = matching.iter().position(|tx| tx.hash == cursor) {
                matching = matching.split_off(pos + 1);
            }
        }
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    fn header_by_hash(&self, hash: &B256) -> Result<Option<BlockHeader>> {
        Ok(self.inner.read().unwrap().headers_by_hash.get(hash).cloned())
    }

    fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .headers_by_number
            .get(&number)
            .and_then(|hash| inner.headers_by_hash.get(hash))
            .cloned())
    }

    fn insert_header(&self, header: BlockHeader) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.headers_by_number.insert(header.number, header.hash);
        inner.headers_by_hash.insert(header.hash, header);
        Ok(())
    }

    fn account_state(&self) -> Result<Option<AccountState>> {
        Ok(self.inner.read().unwrap().account_state.clone())
    }

    fn set_account_state(&self, state: AccountState) -> Result<()> {
        self.inner.write().unwrap().account_state = Some(state);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        *inner = MemoryStoreInner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn sample_tx(hash_byte: u8, block_height: u64, nonce: u64) -> Transaction {
        let mut hash = [0u8; 32];
        hash[31] = hash_byte;
        Transaction {
            hash: B256::from(hash),
            nonce,
            from: Address::ZERO,
            to: Address::ZERO,
            value: U256::from(1),
            gas_price: 1,
            gas_limit: 21_000,
            input: Vec::new(),
            timestamp: 0,
            block_height: Some(block_height),
        }
    }

    #[test]
    fn balance_rejects_stale_height() {
        let store = MemoryStore::new();
        store.set_balance(Contract::Native, U256::from(100), 10).unwrap();
        store.set_balance(Contract::Native, U256::from(1), 5).unwrap();
        assert_eq!(store.balance(Contract::Native).unwrap(), Some(U256::from(100)));
    }

    #[test]
    fn transactions_are_newest_first() {
        let store = MemoryStore::new();
        store.insert_transaction(sample_tx(1, 10, 0)).unwrap();
        store.insert_transaction(sample_tx(2, 12, 0)).unwrap();
        store.insert_transaction(sample_tx(3, 11, 0)).unwrap();

        let results = store.transactions(&TransactionQuery::default()).unwrap();
        let heights: Vec<u64> = results.iter().map(|tx| tx.block_height.unwrap()).collect();
        assert_eq!(heights, vec![12, 11, 10]);
    }

    #[test]
    fn clear_is_total() {
        let store = MemoryStore::new();
        store.set_last_block_height(5).unwrap();
        store.set_balance(Contract::Native, U256::from(1), 5).unwrap();
        store.insert_transaction(sample_tx(1, 5, 0)).unwrap();
        store.clear().unwrap();

        assert_eq!(store.last_block_height().unwrap(), None);
        assert_eq!(store.balance(Contract::Native).unwrap(), None);
        assert!(store.transactions(&TransactionQuery::default()).unwrap().is_empty());
    }
}
