//! Persistent store trait and its SQLite implementation.
//!
//! The `PersistentStore` trait holds the canonical, durable copy of blocks,
//! transactions, token transactions, accounts and contracts, plus the range
//! scans the pagination protocol runs on. `SqliteStore` implements it with a
//! connection pool (r2d2) for concurrent reads and a dedicated writer
//! connection; every upsert runs in one SQLite transaction.

use alloy_primitives::{Address, Bytes, B256, U256};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::cursor::{Ordinal, ScanDirection, ScanRange};
use crate::error::{RepositoryError, RepositoryResult};
use crate::types::{
    Account, AccountKind, BlockLink, Contract, StoredBlock, StoredTransaction, TokenStandard,
    TokenTransaction, TokenTxKey, TokenTxKind,
};

/// Default number of pooled read connections.
const DEFAULT_READ_POOL_SIZE: u32 = 4;

/// Effect of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record did not exist.
    Inserted,
    /// Mutable fields of an existing record were completed or changed.
    Updated,
    /// The record was already present as written.
    Unchanged,
}

impl WriteOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, WriteOutcome::Unchanged)
    }
}

/// Filter set of the token transaction list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenTransactionFilter {
    pub standard: Option<TokenStandard>,
    pub token: Option<Address>,
    pub token_id: Option<U256>,
    /// Matches either side of the transfer.
    pub account: Option<Address>,
    /// Empty means every kind.
    pub kinds: Vec<TokenTxKind>,
}

/// A sequential list and its filter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListQuery {
    Blocks,
    /// Mined transactions. With `account` only, transactions sent or received
    /// by it; with `recipient` too, only those it sent to `recipient`.
    Transactions {
        account: Option<Address>,
        recipient: Option<Address>,
    },
    TokenTransactions(TokenTransactionFilter),
    Contracts {
        validated_only: bool,
    },
}

/// Token contracts seen in stored token transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenContractsQuery {
    /// Contracts of one standard, most token transactions first.
    ByActivity(TokenStandard),
    /// Contracts of one standard `owner` sent or received tokens of, most
    /// recent involvement first.
    Assets {
        standard: TokenStandard,
        owner: Address,
    },
}

/// Natural key of a list element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKey {
    Block(u64),
    Transaction(B256),
    TokenTransaction(TokenTxKey),
    Contract(Address),
}

/// Durable storage of canonical records.
///
/// All methods are synchronous; async callers run them inline since each is a
/// short, indexed query.
pub trait PersistentStore: Send + Sync {
    fn block(&self, number: u64) -> RepositoryResult<Option<StoredBlock>>;

    fn block_by_hash(&self, hash: B256) -> RepositoryResult<Option<StoredBlock>>;

    /// Insert a block; a different block under an existing number conflicts.
    fn store_block(&self, block: &StoredBlock) -> RepositoryResult<WriteOutcome>;

    fn transaction(&self, hash: B256) -> RepositoryResult<Option<StoredTransaction>>;

    /// Insert a transaction or complete its block linkage once.
    fn store_transaction(&self, tx: &StoredTransaction) -> RepositoryResult<WriteOutcome>;

    fn token_transaction(&self, key: &TokenTxKey) -> RepositoryResult<Option<TokenTransaction>>;

    /// Token transactions of one transaction in log order.
    fn token_transactions_by_call(&self, hash: B256) -> RepositoryResult<Vec<TokenTransaction>>;

    fn store_token_transaction(&self, ttx: &TokenTransaction) -> RepositoryResult<WriteOutcome>;

    /// Standard of a token contract as seen in its stored transfers. ERC-1155
    /// wins over ERC-721 when both appear.
    fn token_standard(&self, token: Address) -> RepositoryResult<Option<TokenStandard>>;

    /// Up to `limit` distinct token contract addresses.
    fn token_contracts(
        &self,
        query: &TokenContractsQuery,
        limit: u32,
    ) -> RepositoryResult<Vec<Address>>;

    fn account(&self, address: Address) -> RepositoryResult<Option<Account>>;

    fn store_account(&self, account: &Account) -> RepositoryResult<WriteOutcome>;

    /// Move the account's last activity forward, creating a wallet if needed.
    fn mark_account_activity(&self, address: Address, block: u64)
        -> RepositoryResult<WriteOutcome>;

    fn account_count(&self) -> RepositoryResult<u64>;

    fn contract(&self, address: Address) -> RepositoryResult<Option<Contract>>;

    fn store_contract(&self, contract: &Contract) -> RepositoryResult<WriteOutcome>;

    /// Read up to `range.limit` list entries beyond the anchor, nearest first.
    fn scan(
        &self,
        query: &ListQuery,
        range: ScanRange,
    ) -> RepositoryResult<Vec<(Ordinal, ListKey)>>;

    fn contains(&self, query: &ListQuery, ordinal: Ordinal) -> RepositoryResult<bool>;

    fn count(&self, query: &ListQuery) -> RepositoryResult<u64>;

    fn last_known_block(&self) -> RepositoryResult<Option<u64>>;

    fn set_last_known_block(&self, number: u64) -> RepositoryResult<()>;
}

/// Persistent store backed by SQLite.
///
/// Uses a connection pool for concurrent reads and a dedicated writer
/// connection for serialized writes. WAL mode lets readers proceed without
/// blocking the writer and vice versa.
pub struct SqliteStore {
    /// Connection pool for read operations (concurrent).
    read_pool: Pool<SqliteConnectionManager>,
    /// Dedicated connection for write operations (serialized).
    writer: Mutex<Connection>,
}

/// Configure a connection with standard PRAGMAs for WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )
}

impl SqliteStore {
    /// Open an on-disk store with the default read pool size.
    pub fn new(db_path: impl AsRef<std::path::Path>) -> RepositoryResult<Self> {
        Self::open(db_path, DEFAULT_READ_POOL_SIZE)
    }

    /// Open an on-disk store with `read_pool_size` read connections.
    pub fn open(
        db_path: impl AsRef<std::path::Path>,
        read_pool_size: u32,
    ) -> RepositoryResult<Self> {
        let writer = Connection::open(&db_path)?;
        configure_connection(&writer)?;
        init_schema(&writer)?;

        let manager = SqliteConnectionManager::file(&db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(|conn| configure_connection(conn));
        let read_pool = Pool::builder()
            .max_size(read_pool_size.max(1))
            .build(manager)?;

        tracing::info!(path = %db_path.as_ref().display(), "persistent store opened");
        Ok(Self {
            read_pool,
            writer: Mutex::new(writer),
        })
    }

    /// Create an in-memory store for testing.
    ///
    /// In-memory SQLite DBs are per-connection, so all connections attach to
    /// one named database through a shared-cache URI.
    pub fn in_memory() -> RepositoryResult<Self> {
        let uri = format!("file:opera_store_{}?mode=memory&cache=shared", unique_id());
        let writer = Connection::open(&uri)?;
        configure_connection(&writer)?;
        init_schema(&writer)?;

        let manager =
            SqliteConnectionManager::file(&uri).with_init(|conn| configure_connection(conn));
        let read_pool = Pool::builder().max_size(2).build(manager)?;

        Ok(Self {
            read_pool,
            writer: Mutex::new(writer),
        })
    }

    fn read_conn(&self) -> RepositoryResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.read_pool.get()?)
    }
}

fn init_schema(conn: &Connection) -> RepositoryResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blocks (
             number INTEGER PRIMARY KEY,
             hash BLOB NOT NULL UNIQUE,
             parent_hash BLOB NOT NULL,
             timestamp INTEGER NOT NULL,
             gas_limit INTEGER NOT NULL,
             gas_used INTEGER NOT NULL,
             transactions BLOB NOT NULL
         );

         CREATE TABLE IF NOT EXISTS transactions (
             hash BLOB PRIMARY KEY,
             ordinal BLOB,
             from_addr BLOB NOT NULL,
             to_addr BLOB,
             contract_address BLOB,
             nonce INTEGER NOT NULL,
             value BLOB NOT NULL,
             gas INTEGER NOT NULL,
             gas_price BLOB NOT NULL,
             input BLOB NOT NULL,
             block_number INTEGER,
             block_hash BLOB,
             tx_index INTEGER,
             block_timestamp INTEGER,
             gas_used INTEGER,
             status INTEGER
         );
         CREATE INDEX IF NOT EXISTS idx_tx_ordinal ON transactions(ordinal);
         CREATE INDEX IF NOT EXISTS idx_tx_from ON transactions(from_addr, ordinal);
         CREATE INDEX IF NOT EXISTS idx_tx_to ON transactions(to_addr, ordinal);

         CREATE TABLE IF NOT EXISTS token_transactions (
             transaction_hash BLOB NOT NULL,
             log_index INTEGER NOT NULL,
             position INTEGER NOT NULL,
             ordinal BLOB NOT NULL,
             block_number INTEGER NOT NULL,
             token BLOB NOT NULL,
             standard INTEGER NOT NULL,
             kind INTEGER NOT NULL,
             sender BLOB NOT NULL,
             recipient BLOB NOT NULL,
             amount BLOB NOT NULL,
             token_id BLOB,
             timestamp INTEGER NOT NULL,
             PRIMARY KEY (transaction_hash, log_index, position)
         );
         CREATE INDEX IF NOT EXISTS idx_ttx_ordinal ON token_transactions(ordinal);
         CREATE INDEX IF NOT EXISTS idx_ttx_token ON token_transactions(token, ordinal);
         CREATE INDEX IF NOT EXISTS idx_ttx_sender ON token_transactions(sender, ordinal);
         CREATE INDEX IF NOT EXISTS idx_ttx_recipient ON token_transactions(recipient, ordinal);

         CREATE TABLE IF NOT EXISTS accounts (
             address BLOB PRIMARY KEY,
             kind INTEGER NOT NULL,
             deployed_by BLOB,
             last_activity INTEGER
         );

         CREATE TABLE IF NOT EXISTS contracts (
             address BLOB PRIMARY KEY,
             transaction_hash BLOB NOT NULL,
             ordinal BLOB NOT NULL,
             timestamp INTEGER NOT NULL,
             name TEXT NOT NULL,
             version TEXT NOT NULL,
             license TEXT NOT NULL,
             support_contact TEXT NOT NULL,
             compiler TEXT NOT NULL,
             source_code TEXT NOT NULL,
             abi TEXT NOT NULL,
             validated INTEGER
         );
         CREATE INDEX IF NOT EXISTS idx_contracts_ordinal ON contracts(ordinal);

         CREATE TABLE IF NOT EXISTS metadata (
             key TEXT PRIMARY KEY,
             value INTEGER NOT NULL
         );",
    )?;
    Ok(())
}

const BLOCK_COLUMNS: &str = "number, hash, parent_hash, timestamp, gas_limit, gas_used, transactions";

const TX_COLUMNS: &str = "hash, from_addr, to_addr, contract_address, nonce, value, gas, gas_price,
     input, block_number, block_hash, tx_index, block_timestamp, gas_used, status";

const TTX_COLUMNS: &str = "transaction_hash, log_index, position, block_number, token, standard,
     kind, sender, recipient, amount, token_id, timestamp";

const CONTRACT_COLUMNS: &str = "address, transaction_hash, ordinal, timestamp, name, version,
     license, support_contact, compiler, source_code, abi, validated";

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredBlock> {
    let number: i64 = row.get(0)?;
    let hash: Vec<u8> = row.get(1)?;
    let parent_hash: Vec<u8> = row.get(2)?;
    let timestamp: i64 = row.get(3)?;
    let gas_limit: i64 = row.get(4)?;
    let gas_used: i64 = row.get(5)?;
    let packed: Vec<u8> = row.get(6)?;

    if packed.len() % 32 != 0 {
        return Err(conversion_failure(
            6,
            format!("packed hash list of {} bytes", packed.len()),
        ));
    }

    Ok(StoredBlock {
        number: number as u64,
        hash: b256_from_row(&hash, 1)?,
        parent_hash: b256_from_row(&parent_hash, 2)?,
        timestamp: timestamp as u64,
        gas_limit: gas_limit as u64,
        gas_used: gas_used as u64,
        transactions: packed.chunks_exact(32).map(B256::from_slice).collect(),
    })
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredTransaction> {
    let hash: Vec<u8> = row.get(0)?;
    let from: Vec<u8> = row.get(1)?;
    let to: Option<Vec<u8>> = row.get(2)?;
    let contract_address: Option<Vec<u8>> = row.get(3)?;
    let nonce: i64 = row.get(4)?;
    let value: Vec<u8> = row.get(5)?;
    let gas: i64 = row.get(6)?;
    let gas_price: Vec<u8> = row.get(7)?;
    let input: Vec<u8> = row.get(8)?;
    let block_number: Option<i64> = row.get(9)?;
    let block_hash: Option<Vec<u8>> = row.get(10)?;
    let tx_index: Option<i64> = row.get(11)?;
    let block_timestamp: Option<i64> = row.get(12)?;
    let gas_used: Option<i64> = row.get(13)?;
    let status: Option<i64> = row.get(14)?;

    let block = match (block_number, block_hash) {
        (Some(number), Some(hash)) => Some(BlockLink {
            number: number as u64,
            hash: b256_from_row(&hash, 10)?,
            index: tx_index.unwrap_or_default() as u32,
            timestamp: block_timestamp.unwrap_or_default() as u64,
            gas_used: gas_used.unwrap_or_default() as u64,
            status: status.unwrap_or_default() as u8,
        }),
        _ => None,
    };

    Ok(StoredTransaction {
        hash: b256_from_row(&hash, 0)?,
        from: address_from_row(&from, 1)?,
        to: to.as_deref().map(|b| address_from_row(b, 2)).transpose()?,
        contract_address: contract_address
            .as_deref()
            .map(|b| address_from_row(b, 3))
            .transpose()?,
        nonce: nonce as u64,
        value: U256::from_be_slice(&value),
        gas: gas as u64,
        gas_price: U256::from_be_slice(&gas_price),
        input: Bytes::from(input),
        block,
    })
}

fn row_to_token_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenTransaction> {
    let transaction_hash: Vec<u8> = row.get(0)?;
    let log_index: i64 = row.get(1)?;
    let position: i64 = row.get(2)?;
    let block_number: i64 = row.get(3)?;
    let token: Vec<u8> = row.get(4)?;
    let standard: i64 = row.get(5)?;
    let kind: i64 = row.get(6)?;
    let sender: Vec<u8> = row.get(7)?;
    let recipient: Vec<u8> = row.get(8)?;
    let amount: Vec<u8> = row.get(9)?;
    let token_id: Option<Vec<u8>> = row.get(10)?;
    let timestamp: i64 = row.get(11)?;

    let standard = TokenStandard::from_code(standard)
        .ok_or_else(|| conversion_failure(5, format!("unknown token standard {standard}")))?;

    Ok(TokenTransaction {
        transaction_hash: b256_from_row(&transaction_hash, 0)?,
        log_index: log_index as u32,
        position: position as u32,
        block_number: block_number as u64,
        token: address_from_row(&token, 4)?,
        standard,
        kind: TokenTxKind::from_code(kind),
        sender: address_from_row(&sender, 7)?,
        recipient: address_from_row(&recipient, 8)?,
        amount: U256::from_be_slice(&amount),
        token_id: token_id.map(|b| U256::from_be_slice(&b)),
        timestamp: timestamp as u64,
    })
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let address: Vec<u8> = row.get(0)?;
    let kind: i64 = row.get(1)?;
    let deployed_by: Option<Vec<u8>> = row.get(2)?;
    let last_activity: Option<i64> = row.get(3)?;

    Ok(Account {
        address: address_from_row(&address, 0)?,
        kind: if kind == 1 {
            AccountKind::Contract
        } else {
            AccountKind::Wallet
        },
        deployed_by: deployed_by
            .as_deref()
            .map(|b| b256_from_row(b, 2))
            .transpose()?,
        last_activity: last_activity.map(|n| n as u64),
    })
}

fn row_to_contract(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contract> {
    let address: Vec<u8> = row.get(0)?;
    let transaction_hash: Vec<u8> = row.get(1)?;
    let ordinal: Vec<u8> = row.get(2)?;
    let timestamp: i64 = row.get(3)?;
    let validated: Option<i64> = row.get(11)?;

    Ok(Contract {
        address: address_from_row(&address, 0)?,
        transaction_hash: b256_from_row(&transaction_hash, 1)?,
        ordinal: ordinal_from_row(&ordinal, 2)?,
        timestamp: timestamp as u64,
        name: row.get(4)?,
        version: row.get(5)?,
        license: row.get(6)?,
        support_contact: row.get(7)?,
        compiler: row.get(8)?,
        source_code: row.get(9)?,
        abi: row.get(10)?,
        validated: validated.map(|v| v as u64),
    })
}

fn account_kind_code(kind: AccountKind) -> i64 {
    match kind {
        AccountKind::Wallet => 0,
        AccountKind::Contract => 1,
    }
}

/// Merge a write-once optional field.
fn merge_once<T: PartialEq + Copy + std::fmt::Debug>(
    field: &str,
    current: Option<T>,
    incoming: Option<T>,
) -> RepositoryResult<(Option<T>, bool)> {
    match (current, incoming) {
        (Some(a), Some(b)) if a != b => Err(RepositoryError::Conflict(format!(
            "{field} already set to {a:?}, refusing {b:?}"
        ))),
        (None, Some(b)) => Ok((Some(b), true)),
        (current, _) => Ok((current, false)),
    }
}

/// SQL pieces of a list query.
struct ListSql {
    table: &'static str,
    keys: &'static str,
    conditions: Vec<String>,
    values: Vec<Value>,
}

impl ListSql {
    fn new(query: &ListQuery) -> Self {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        let (table, keys) = match query {
            ListQuery::Blocks => ("blocks", "number"),
            ListQuery::Transactions { account, recipient } => {
                conditions.push("ordinal IS NOT NULL".to_string());
                match (account, recipient) {
                    (Some(account), Some(recipient)) => {
                        conditions.push("from_addr = ? AND to_addr = ?".to_string());
                        values.push(address_value(account));
                        values.push(address_value(recipient));
                    }
                    (Some(account), None) => {
                        conditions.push("(from_addr = ? OR to_addr = ?)".to_string());
                        values.push(address_value(account));
                        values.push(address_value(account));
                    }
                    (None, Some(recipient)) => {
                        conditions.push("to_addr = ?".to_string());
                        values.push(address_value(recipient));
                    }
                    (None, None) => {}
                }
                ("transactions", "hash")
            }
            ListQuery::TokenTransactions(filter) => {
                if let Some(standard) = filter.standard {
                    conditions.push("standard = ?".to_string());
                    values.push(Value::Integer(standard.code()));
                }
                if let Some(token) = &filter.token {
                    conditions.push("token = ?".to_string());
                    values.push(address_value(token));
                }
                if let Some(token_id) = &filter.token_id {
                    conditions.push("token_id = ?".to_string());
                    values.push(Value::Blob(token_id.to_be_bytes::<32>().to_vec()));
                }
                if let Some(account) = &filter.account {
                    conditions.push("(sender = ? OR recipient = ?)".to_string());
                    values.push(address_value(account));
                    values.push(address_value(account));
                }
                if !filter.kinds.is_empty() {
                    let marks = vec!["?"; filter.kinds.len()].join(", ");
                    conditions.push(format!("kind IN ({marks})"));
                    values.extend(filter.kinds.iter().map(|k| Value::Integer(k.code())));
                }
                ("token_transactions", "transaction_hash, log_index, position")
            }
            ListQuery::Contracts { validated_only } => {
                if *validated_only {
                    conditions.push("validated IS NOT NULL".to_string());
                }
                ("contracts", "address")
            }
        };

        Self {
            table,
            keys,
            conditions,
            values,
        }
    }

    fn ordinal_column(&self) -> &'static str {
        if self.table == "blocks" {
            "number"
        } else {
            "ordinal"
        }
    }

    /// Bind value of an ordinal, `None` when no row of this list can hold it.
    ///
    /// Block numbers are integers; every other list stores 16 big-endian
    /// bytes, and SQLite compares blobs bytewise.
    fn ordinal_value(&self, ordinal: Ordinal) -> Option<Value> {
        if self.table == "blocks" {
            i64::try_from(ordinal).ok().map(Value::Integer)
        } else {
            Some(Value::Blob(ordinal_blob(ordinal)))
        }
    }

    fn row_ordinal(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Ordinal> {
        if self.table == "blocks" {
            let number: i64 = row.get(0)?;
            Ok(number as u64 as Ordinal)
        } else {
            let bytes: Vec<u8> = row.get(0)?;
            ordinal_from_row(&bytes, 0)
        }
    }

    fn where_clause(&self, extra: Option<String>) -> String {
        let mut all: Vec<&str> = self.conditions.iter().map(String::as_str).collect();
        if let Some(extra) = extra.as_deref() {
            all.push(extra);
        }
        if all.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", all.join(" AND "))
        }
    }

    fn row_key(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<ListKey> {
        match self.table {
            "blocks" => {
                let number: i64 = row.get(1)?;
                Ok(ListKey::Block(number as u64))
            }
            "transactions" => {
                let hash: Vec<u8> = row.get(1)?;
                Ok(ListKey::Transaction(b256_from_row(&hash, 1)?))
            }
            "token_transactions" => {
                let hash: Vec<u8> = row.get(1)?;
                let log_index: i64 = row.get(2)?;
                let position: i64 = row.get(3)?;
                Ok(ListKey::TokenTransaction(TokenTxKey {
                    transaction_hash: b256_from_row(&hash, 1)?,
                    log_index: log_index as u32,
                    position: position as u32,
                }))
            }
            _ => {
                let address: Vec<u8> = row.get(1)?;
                Ok(ListKey::Contract(address_from_row(&address, 1)?))
            }
        }
    }
}

impl PersistentStore for SqliteStore {
    fn block(&self, number: u64) -> RepositoryResult<Option<StoredBlock>> {
        let conn = self.read_conn()?;
        let block = conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE number = ?"),
                params![number as i64],
                row_to_block,
            )
            .optional()?;
        Ok(block)
    }

    fn block_by_hash(&self, hash: B256) -> RepositoryResult<Option<StoredBlock>> {
        let conn = self.read_conn()?;
        let block = conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE hash = ?"),
                params![hash.as_slice()],
                row_to_block,
            )
            .optional()?;
        Ok(block)
    }

    fn store_block(&self, block: &StoredBlock) -> RepositoryResult<WriteOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE number = ?"),
                params![block.number as i64],
                row_to_block,
            )
            .optional()?;

        let outcome = match existing {
            Some(current) if current == *block => WriteOutcome::Unchanged,
            Some(current) => {
                return Err(RepositoryError::Conflict(format!(
                    "block {} already stored with hash {}",
                    current.number, current.hash
                )));
            }
            None => {
                let packed: Vec<u8> = block
                    .transactions
                    .iter()
                    .flat_map(|h| h.as_slice().iter().copied())
                    .collect();
                tx.execute(
                    "INSERT INTO blocks
                     (number, hash, parent_hash, timestamp, gas_limit, gas_used, transactions)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        block.number as i64,
                        block.hash.as_slice(),
                        block.parent_hash.as_slice(),
                        block.timestamp as i64,
                        block.gas_limit as i64,
                        block.gas_used as i64,
                        packed,
                    ],
                )?;
                WriteOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn transaction(&self, hash: B256) -> RepositoryResult<Option<StoredTransaction>> {
        let conn = self.read_conn()?;
        let tx = conn
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM transactions WHERE hash = ?"),
                params![hash.as_slice()],
                row_to_transaction,
            )
            .optional()?;
        Ok(tx)
    }

    fn store_transaction(&self, incoming: &StoredTransaction) -> RepositoryResult<WriteOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM transactions WHERE hash = ?"),
                params![incoming.hash.as_slice()],
                row_to_transaction,
            )
            .optional()?;

        let outcome = match existing {
            None => {
                insert_transaction(&tx, incoming)?;
                WriteOutcome::Inserted
            }
            Some(current) => {
                if !current.same_payload(incoming) {
                    return Err(RepositoryError::Conflict(format!(
                        "transaction {} differs from the stored record",
                        incoming.hash
                    )));
                }

                let (contract_address, contract_changed) = merge_once(
                    "contract address",
                    current.contract_address,
                    incoming.contract_address,
                )?;

                let link = match (&current.block, &incoming.block) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(RepositoryError::Conflict(format!(
                            "transaction {} already linked to block {}",
                            incoming.hash, a.number
                        )));
                    }
                    (None, Some(b)) => Some(b),
                    _ => None,
                };

                if let Some(link) = link {
                    tx.execute(
                        "UPDATE transactions SET ordinal = ?, block_number = ?, block_hash = ?,
                             tx_index = ?, block_timestamp = ?, gas_used = ?, status = ?
                         WHERE hash = ?",
                        params![
                            incoming.ordinal().map(ordinal_blob),
                            link.number as i64,
                            link.hash.as_slice(),
                            link.index as i64,
                            link.timestamp as i64,
                            link.gas_used as i64,
                            link.status as i64,
                            incoming.hash.as_slice(),
                        ],
                    )?;
                }
                if contract_changed {
                    tx.execute(
                        "UPDATE transactions SET contract_address = ? WHERE hash = ?",
                        params![
                            contract_address.as_ref().map(|a| a.as_slice()),
                            incoming.hash.as_slice()
                        ],
                    )?;
                }

                if link.is_some() || contract_changed {
                    WriteOutcome::Updated
                } else {
                    WriteOutcome::Unchanged
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn token_transaction(&self, key: &TokenTxKey) -> RepositoryResult<Option<TokenTransaction>> {
        let conn = self.read_conn()?;
        let ttx = conn
            .query_row(
                &format!(
                    "SELECT {TTX_COLUMNS} FROM token_transactions
                     WHERE transaction_hash = ? AND log_index = ? AND position = ?"
                ),
                params![
                    key.transaction_hash.as_slice(),
                    key.log_index as i64,
                    key.position as i64
                ],
                row_to_token_transaction,
            )
            .optional()?;
        Ok(ttx)
    }

    fn token_transactions_by_call(&self, hash: B256) -> RepositoryResult<Vec<TokenTransaction>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TTX_COLUMNS} FROM token_transactions
             WHERE transaction_hash = ? ORDER BY log_index, position"
        ))?;
        let rows: rusqlite::Result<Vec<TokenTransaction>> = stmt
            .query_map(params![hash.as_slice()], row_to_token_transaction)?
            .collect();
        Ok(rows?)
    }

    fn store_token_transaction(&self, ttx: &TokenTransaction) -> RepositoryResult<WriteOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {TTX_COLUMNS} FROM token_transactions
                     WHERE transaction_hash = ? AND log_index = ? AND position = ?"
                ),
                params![
                    ttx.transaction_hash.as_slice(),
                    ttx.log_index as i64,
                    ttx.position as i64
                ],
                row_to_token_transaction,
            )
            .optional()?;

        let outcome = match existing {
            Some(current) if current == *ttx => WriteOutcome::Unchanged,
            Some(_) => {
                return Err(RepositoryError::Conflict(format!(
                    "token transaction {} differs from the stored record",
                    ttx.key()
                )));
            }
            None => {
                tx.execute(
                    "INSERT INTO token_transactions
                     (transaction_hash, log_index, position, ordinal, block_number, token,
                      standard, kind, sender, recipient, amount, token_id, timestamp)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        ttx.transaction_hash.as_slice(),
                        ttx.log_index as i64,
                        ttx.position as i64,
                        ordinal_blob(ttx.ordinal()),
                        ttx.block_number as i64,
                        ttx.token.as_slice(),
                        ttx.standard.code(),
                        ttx.kind.code(),
                        ttx.sender.as_slice(),
                        ttx.recipient.as_slice(),
                        ttx.amount.to_be_bytes::<32>().to_vec(),
                        ttx.token_id.map(|id| id.to_be_bytes::<32>().to_vec()),
                        ttx.timestamp as i64,
                    ],
                )?;
                WriteOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn token_standard(&self, token: Address) -> RepositoryResult<Option<TokenStandard>> {
        let conn = self.read_conn()?;
        let code: Option<i64> = conn
            .query_row(
                "SELECT MAX(standard) FROM token_transactions WHERE token = ?",
                params![token.as_slice()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(code.and_then(TokenStandard::from_code))
    }

    fn token_contracts(
        &self,
        query: &TokenContractsQuery,
        limit: u32,
    ) -> RepositoryResult<Vec<Address>> {
        let (statement, values) = match query {
            TokenContractsQuery::ByActivity(standard) => (
                "SELECT token FROM token_transactions WHERE standard = ?
                 GROUP BY token ORDER BY COUNT(*) DESC, MAX(ordinal) DESC LIMIT ?",
                vec![Value::Integer(standard.code()), Value::Integer(i64::from(limit))],
            ),
            TokenContractsQuery::Assets { standard, owner } => (
                "SELECT token FROM token_transactions
                 WHERE standard = ? AND (sender = ? OR recipient = ?)
                 GROUP BY token ORDER BY MAX(ordinal) DESC LIMIT ?",
                vec![
                    Value::Integer(standard.code()),
                    address_value(owner),
                    address_value(owner),
                    Value::Integer(i64::from(limit)),
                ],
            ),
        };

        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(statement)?;
        let tokens: rusqlite::Result<Vec<Address>> = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let token: Vec<u8> = row.get(0)?;
                address_from_row(&token, 0)
            })?
            .collect();
        Ok(tokens?)
    }

    fn account(&self, address: Address) -> RepositoryResult<Option<Account>> {
        let conn = self.read_conn()?;
        let account = conn
            .query_row(
                "SELECT address, kind, deployed_by, last_activity FROM accounts WHERE address = ?",
                params![address.as_slice()],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    fn store_account(&self, account: &Account) -> RepositoryResult<WriteOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT address, kind, deployed_by, last_activity FROM accounts WHERE address = ?",
                params![account.address.as_slice()],
                row_to_account,
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO accounts (address, kind, deployed_by, last_activity)
                     VALUES (?, ?, ?, ?)",
                    params![
                        account.address.as_slice(),
                        account_kind_code(account.kind),
                        account.deployed_by.as_ref().map(|h| h.as_slice()),
                        account.last_activity.map(|n| n as i64),
                    ],
                )?;
                WriteOutcome::Inserted
            }
            Some(current) => {
                let (deployed_by, _) =
                    merge_once("deployment", current.deployed_by, account.deployed_by)?;
                let kind = if current.kind == AccountKind::Contract
                    || account.kind == AccountKind::Contract
                {
                    AccountKind::Contract
                } else {
                    AccountKind::Wallet
                };
                let last_activity = current.last_activity.max(account.last_activity);

                let merged = Account {
                    address: current.address,
                    kind,
                    deployed_by,
                    last_activity,
                };
                if merged == current {
                    WriteOutcome::Unchanged
                } else {
                    tx.execute(
                        "UPDATE accounts SET kind = ?, deployed_by = ?, last_activity = ?
                         WHERE address = ?",
                        params![
                            account_kind_code(merged.kind),
                            merged.deployed_by.as_ref().map(|h| h.as_slice()),
                            merged.last_activity.map(|n| n as i64),
                            merged.address.as_slice(),
                        ],
                    )?;
                    WriteOutcome::Updated
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn mark_account_activity(
        &self,
        address: Address,
        block: u64,
    ) -> RepositoryResult<WriteOutcome> {
        let mut account = Account::wallet(address);
        account.last_activity = Some(block);
        self.store_account(&account)
    }

    fn account_count(&self) -> RepositoryResult<u64> {
        let conn = self.read_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn contract(&self, address: Address) -> RepositoryResult<Option<Contract>> {
        let conn = self.read_conn()?;
        let contract = conn
            .query_row(
                &format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE address = ?"),
                params![address.as_slice()],
                row_to_contract,
            )
            .optional()?;
        Ok(contract)
    }

    fn store_contract(&self, contract: &Contract) -> RepositoryResult<WriteOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE address = ?"),
                params![contract.address.as_slice()],
                row_to_contract,
            )
            .optional()?;

        let outcome = match existing {
            Some(current) if !current.same_deployment(contract) => {
                return Err(RepositoryError::Conflict(format!(
                    "contract {} already deployed by {}",
                    current.address, current.transaction_hash
                )));
            }
            Some(current) if current == *contract => WriteOutcome::Unchanged,
            Some(_) => {
                tx.execute(
                    "UPDATE contracts SET name = ?, version = ?, license = ?, support_contact = ?,
                         compiler = ?, source_code = ?, abi = ?, validated = ?
                     WHERE address = ?",
                    params![
                        contract.name,
                        contract.version,
                        contract.license,
                        contract.support_contact,
                        contract.compiler,
                        contract.source_code,
                        contract.abi,
                        contract.validated.map(|v| v as i64),
                        contract.address.as_slice(),
                    ],
                )?;
                WriteOutcome::Updated
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO contracts ({CONTRACT_COLUMNS})
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                    ),
                    params![
                        contract.address.as_slice(),
                        contract.transaction_hash.as_slice(),
                        ordinal_blob(contract.ordinal),
                        contract.timestamp as i64,
                        contract.name,
                        contract.version,
                        contract.license,
                        contract.support_contact,
                        contract.compiler,
                        contract.source_code,
                        contract.abi,
                        contract.validated.map(|v| v as i64),
                    ],
                )?;
                WriteOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn scan(
        &self,
        query: &ListQuery,
        range: ScanRange,
    ) -> RepositoryResult<Vec<(Ordinal, ListKey)>> {
        let mut sql = ListSql::new(query);
        let ordinal = sql.ordinal_column();
        let (op, order) = match range.direction {
            ScanDirection::Older => ("<", "DESC"),
            ScanDirection::Newer => (">", "ASC"),
        };
        let extra = match range.anchor.map(|anchor| sql.ordinal_value(anchor)) {
            None => None,
            Some(Some(anchor)) => {
                sql.values.push(anchor);
                Some(format!("{ordinal} {op} ?"))
            }
            // block anchor past every storable number
            Some(None) => match range.direction {
                ScanDirection::Older => None,
                ScanDirection::Newer => return Ok(Vec::new()),
            },
        };
        let statement = format!(
            "SELECT {ordinal}, {keys} FROM {table}{filter} ORDER BY {ordinal} {order} LIMIT {limit}",
            keys = sql.keys,
            table = sql.table,
            filter = sql.where_clause(extra),
            limit = range.limit,
        );

        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&statement)?;
        let rows: rusqlite::Result<Vec<(Ordinal, ListKey)>> = stmt
            .query_map(params_from_iter(sql.values.iter()), |row| {
                Ok((sql.row_ordinal(row)?, sql.row_key(row)?))
            })?
            .collect();
        Ok(rows?)
    }

    fn contains(&self, query: &ListQuery, ordinal: Ordinal) -> RepositoryResult<bool> {
        let mut sql = ListSql::new(query);
        let column = sql.ordinal_column();
        let Some(value) = sql.ordinal_value(ordinal) else {
            return Ok(false);
        };
        sql.values.push(value);
        let statement = format!(
            "SELECT EXISTS(SELECT 1 FROM {table}{filter})",
            table = sql.table,
            filter = sql.where_clause(Some(format!("{column} = ?"))),
        );

        let conn = self.read_conn()?;
        let exists: bool =
            conn.query_row(&statement, params_from_iter(sql.values.iter()), |row| {
                row.get(0)
            })?;
        Ok(exists)
    }

    fn count(&self, query: &ListQuery) -> RepositoryResult<u64> {
        let sql = ListSql::new(query);
        let statement = format!(
            "SELECT COUNT(*) FROM {table}{filter}",
            table = sql.table,
            filter = sql.where_clause(None),
        );

        let conn = self.read_conn()?;
        let count: i64 =
            conn.query_row(&statement, params_from_iter(sql.values.iter()), |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    fn last_known_block(&self) -> RepositoryResult<Option<u64>> {
        let conn = self.read_conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'last_known_block'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|n| n as u64))
    }

    fn set_last_known_block(&self, number: u64) -> RepositoryResult<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('last_known_block', ?)",
            params![number as i64],
        )?;
        Ok(())
    }
}

fn insert_transaction(
    tx: &rusqlite::Transaction<'_>,
    transaction: &StoredTransaction,
) -> RepositoryResult<()> {
    let link = transaction.block.as_ref();
    tx.execute(
        "INSERT INTO transactions
         (hash, ordinal, from_addr, to_addr, contract_address, nonce, value, gas, gas_price,
          input, block_number, block_hash, tx_index, block_timestamp, gas_used, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            transaction.hash.as_slice(),
            transaction.ordinal().map(ordinal_blob),
            transaction.from.as_slice(),
            transaction.to.as_ref().map(|a| a.as_slice()),
            transaction.contract_address.as_ref().map(|a| a.as_slice()),
            transaction.nonce as i64,
            transaction.value.to_be_bytes::<32>().to_vec(),
            transaction.gas as i64,
            transaction.gas_price.to_be_bytes::<32>().to_vec(),
            transaction.input.as_ref(),
            link.map(|l| l.number as i64),
            link.map(|l| l.hash.as_slice()),
            link.map(|l| l.index as i64),
            link.map(|l| l.timestamp as i64),
            link.map(|l| l.gas_used as i64),
            link.map(|l| l.status as i64),
        ],
    )?;
    Ok(())
}

fn ordinal_blob(ordinal: Ordinal) -> Vec<u8> {
    ordinal.to_be_bytes().to_vec()
}

fn ordinal_from_row(bytes: &[u8], col: usize) -> rusqlite::Result<Ordinal> {
    let raw: [u8; 16] = bytes.try_into().map_err(|_| {
        conversion_failure(
            col,
            format!("expected 16 bytes for an ordinal, got {}", bytes.len()),
        )
    })?;
    Ok(Ordinal::from_be_bytes(raw))
}

fn address_value(address: &Address) -> Value {
    Value::Blob(address.as_slice().to_vec())
}

/// Generate a unique ID for in-memory shared-cache SQLite databases.
fn unique_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn conversion_failure(col: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Blob, message.into())
}

fn b256_from_row(bytes: &[u8], col: usize) -> rusqlite::Result<B256> {
    if bytes.len() != 32 {
        return Err(conversion_failure(
            col,
            format!("expected 32 bytes for B256, got {}", bytes.len()),
        ));
    }
    Ok(B256::from_slice(bytes))
}

fn address_from_row(bytes: &[u8], col: usize) -> rusqlite::Result<Address> {
    if bytes.len() != 20 {
        return Err(conversion_failure(
            col,
            format!("expected 20 bytes for Address, got {}", bytes.len()),
        ));
    }
    Ok(Address::from_slice(bytes))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_test_block(number: u64) -> StoredBlock {
        StoredBlock {
            number,
            hash: B256::repeat_byte(number as u8),
            parent_hash: if number > 0 {
                B256::repeat_byte((number - 1) as u8)
            } else {
                B256::ZERO
            },
            timestamp: 1000 + number * 12,
            gas_limit: 30_000_000,
            gas_used: 21000,
            transactions: vec![],
        }
    }

    pub(crate) fn make_test_transaction(hash: B256, block: Option<(u64, u32)>) -> StoredTransaction {
        StoredTransaction {
            hash,
            from: Address::repeat_byte(0x01),
            to: Some(Address::repeat_byte(0x02)),
            contract_address: None,
            nonce: 3,
            value: U256::from(100u64),
            gas: 21000,
            gas_price: U256::from(1_000_000_000u64),
            input: Bytes::new(),
            block: block.map(|(number, index)| BlockLink {
                number,
                hash: B256::repeat_byte(number as u8),
                index,
                timestamp: 1000 + number * 12,
                gas_used: 21000,
                status: 1,
            }),
        }
    }

    pub(crate) fn make_test_token_transaction(
        block_number: u64,
        log_index: u32,
        kind: TokenTxKind,
    ) -> TokenTransaction {
        TokenTransaction {
            transaction_hash: B256::repeat_byte(0x40 + (log_index % 16) as u8),
            log_index,
            position: 0,
            block_number,
            token: Address::repeat_byte(0x70),
            standard: TokenStandard::Erc20,
            kind,
            sender: Address::repeat_byte(0x01),
            recipient: Address::repeat_byte(0x02),
            amount: U256::from(5u64),
            token_id: None,
            timestamp: 1000 + block_number,
        }
    }

    fn older(anchor: Option<Ordinal>, limit: usize) -> ScanRange {
        ScanRange {
            anchor,
            direction: ScanDirection::Older,
            limit,
        }
    }

    #[test]
    fn test_block_round_trip_with_transaction_hashes() {
        let store = SqliteStore::in_memory().unwrap();
        let mut block = make_test_block(7);
        block.transactions = vec![B256::repeat_byte(0x10), B256::repeat_byte(0x11)];

        assert_eq!(store.store_block(&block).unwrap(), WriteOutcome::Inserted);
        assert_eq!(store.block(7).unwrap(), Some(block.clone()));
        assert_eq!(store.block_by_hash(block.hash).unwrap(), Some(block));
        assert!(store.block(8).unwrap().is_none());
    }

    #[test]
    fn test_block_with_different_hash_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let block = make_test_block(7);
        store.store_block(&block).unwrap();
        assert_eq!(store.store_block(&block).unwrap(), WriteOutcome::Unchanged);

        let mut forked = block.clone();
        forked.hash = B256::repeat_byte(0xff);
        assert!(matches!(
            store.store_block(&forked),
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[test]
    fn test_storing_final_transaction_twice_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let tx = make_test_transaction(B256::repeat_byte(0x20), Some((5, 0)));

        assert_eq!(store.store_transaction(&tx).unwrap(), WriteOutcome::Inserted);
        let once = store.transaction(tx.hash).unwrap();

        assert_eq!(store.store_transaction(&tx).unwrap(), WriteOutcome::Unchanged);
        let twice = store.transaction(tx.hash).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice, Some(tx));
    }

    #[test]
    fn test_pending_transaction_linkage_completed_once() {
        let store = SqliteStore::in_memory().unwrap();
        let pending = make_test_transaction(B256::repeat_byte(0x21), None);
        store.store_transaction(&pending).unwrap();

        let all = ListQuery::Transactions {
            account: None,
            recipient: None,
        };
        assert_eq!(store.count(&all).unwrap(), 0);

        let mined = make_test_transaction(B256::repeat_byte(0x21), Some((9, 2)));
        assert_eq!(store.store_transaction(&mined).unwrap(), WriteOutcome::Updated);
        assert_eq!(store.transaction(mined.hash).unwrap(), Some(mined.clone()));
        assert_eq!(store.count(&all).unwrap(), 1);

        // seeing it pending again never unlinks it
        assert_eq!(
            store.store_transaction(&pending).unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(store.transaction(mined.hash).unwrap(), Some(mined.clone()));

        let relinked = make_test_transaction(B256::repeat_byte(0x21), Some((10, 0)));
        assert!(matches!(
            store.store_transaction(&relinked),
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[test]
    fn test_changed_immutable_transaction_field_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let tx = make_test_transaction(B256::repeat_byte(0x22), Some((5, 0)));
        store.store_transaction(&tx).unwrap();

        let mut tampered = tx.clone();
        tampered.value = U256::from(1u64);
        assert!(matches!(
            store.store_transaction(&tampered),
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(store.transaction(tx.hash).unwrap(), Some(tx));
    }

    #[test]
    fn test_token_transaction_written_once() {
        let store = SqliteStore::in_memory().unwrap();
        let ttx = make_test_token_transaction(5, 1, TokenTxKind::Transfer);

        assert_eq!(
            store.store_token_transaction(&ttx).unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            store.store_token_transaction(&ttx).unwrap(),
            WriteOutcome::Unchanged
        );

        let mut changed = ttx.clone();
        changed.amount = U256::from(6u64);
        assert!(matches!(
            store.store_token_transaction(&changed),
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(store.token_transaction(&ttx.key()).unwrap(), Some(ttx));
    }

    #[test]
    fn test_token_transactions_by_call_in_log_order() {
        let store = SqliteStore::in_memory().unwrap();
        let hash = B256::repeat_byte(0x99);
        for log_index in [3u32, 1, 2] {
            let mut ttx = make_test_token_transaction(5, log_index, TokenTxKind::Transfer);
            ttx.transaction_hash = hash;
            store.store_token_transaction(&ttx).unwrap();
        }

        let logs: Vec<u32> = store
            .token_transactions_by_call(hash)
            .unwrap()
            .iter()
            .map(|t| t.log_index)
            .collect();
        assert_eq!(logs, vec![1, 2, 3]);
    }

    #[test]
    fn test_token_standard_prefers_multi_token() {
        let store = SqliteStore::in_memory().unwrap();
        let token = Address::repeat_byte(0x70);
        assert_eq!(store.token_standard(token).unwrap(), None);

        let mut nft = make_test_token_transaction(5, 1, TokenTxKind::Transfer);
        nft.standard = TokenStandard::Erc721;
        store.store_token_transaction(&nft).unwrap();
        assert_eq!(
            store.token_standard(token).unwrap(),
            Some(TokenStandard::Erc721)
        );

        let mut multi = make_test_token_transaction(6, 2, TokenTxKind::Transfer);
        multi.standard = TokenStandard::Erc1155;
        store.store_token_transaction(&multi).unwrap();
        assert_eq!(
            store.token_standard(token).unwrap(),
            Some(TokenStandard::Erc1155)
        );
    }

    #[test]
    fn test_account_activity_only_moves_forward() {
        let store = SqliteStore::in_memory().unwrap();
        let address = Address::repeat_byte(0x33);

        assert_eq!(
            store.mark_account_activity(address, 10).unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            store.mark_account_activity(address, 8).unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            store.mark_account_activity(address, 12).unwrap(),
            WriteOutcome::Updated
        );
        assert_eq!(
            store.account(address).unwrap().unwrap().last_activity,
            Some(12)
        );
        assert_eq!(store.account_count().unwrap(), 1);
    }

    #[test]
    fn test_account_deployment_is_write_once() {
        let store = SqliteStore::in_memory().unwrap();
        let address = Address::repeat_byte(0x34);
        store.store_account(&Account::wallet(address)).unwrap();

        let contract = Account::contract(address, B256::repeat_byte(0x01));
        assert_eq!(
            store.store_account(&contract).unwrap(),
            WriteOutcome::Updated
        );
        assert_eq!(store.account(address).unwrap().unwrap().kind, AccountKind::Contract);

        let redeployed = Account::contract(address, B256::repeat_byte(0x02));
        assert!(matches!(
            store.store_account(&redeployed),
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[test]
    fn test_contract_metadata_is_mutable_deployment_is_not() {
        let store = SqliteStore::in_memory().unwrap();
        let deploy = make_test_transaction(B256::repeat_byte(0x50), Some((4, 1)));
        let address = Address::repeat_byte(0x51);
        let contract = Contract::deployed(address, &deploy).unwrap();

        assert_eq!(store.store_contract(&contract).unwrap(), WriteOutcome::Inserted);

        let mut validated = contract.clone();
        validated.name = "Token".to_string();
        validated.validated = Some(1_700_000_000);
        assert_eq!(store.store_contract(&validated).unwrap(), WriteOutcome::Updated);
        assert_eq!(store.contract(address).unwrap(), Some(validated.clone()));

        let mut moved = validated.clone();
        moved.transaction_hash = B256::repeat_byte(0x52);
        assert!(matches!(
            store.store_contract(&moved),
            Err(RepositoryError::Conflict(_))
        ));

        let only_validated = ListQuery::Contracts {
            validated_only: true,
        };
        assert_eq!(store.count(&only_validated).unwrap(), 1);
    }

    #[test]
    fn test_scan_directions_and_filters() {
        let store = SqliteStore::in_memory().unwrap();
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);

        for i in 0..6u8 {
            let mut tx = make_test_transaction(B256::repeat_byte(0x60 + i), Some((i as u64, 0)));
            tx.from = if i % 2 == 0 { alice } else { bob };
            tx.to = Some(if i % 2 == 0 { bob } else { alice });
            if i == 4 {
                tx.to = Some(Address::repeat_byte(0xcc));
            }
            store.store_transaction(&tx).unwrap();
        }

        let all = ListQuery::Transactions {
            account: None,
            recipient: None,
        };
        let newest = store.scan(&all, older(None, 2)).unwrap();
        assert_eq!(
            newest.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![
                ListKey::Transaction(B256::repeat_byte(0x65)),
                ListKey::Transaction(B256::repeat_byte(0x64))
            ]
        );

        let anchor = newest[1].0;
        let newer = store
            .scan(
                &all,
                ScanRange {
                    anchor: Some(anchor),
                    direction: ScanDirection::Newer,
                    limit: 10,
                },
            )
            .unwrap();
        assert_eq!(newer.len(), 1);

        let alice_sent_to_bob = ListQuery::Transactions {
            account: Some(alice),
            recipient: Some(bob),
        };
        assert_eq!(store.count(&alice_sent_to_bob).unwrap(), 2);

        let alice_any = ListQuery::Transactions {
            account: Some(alice),
            recipient: None,
        };
        assert_eq!(store.count(&alice_any).unwrap(), 6);
        assert!(store.contains(&alice_any, anchor).unwrap());
        assert!(!store.contains(&alice_sent_to_bob, anchor).unwrap());
    }

    #[test]
    fn test_token_list_filters() {
        let store = SqliteStore::in_memory().unwrap();
        let kinds = [
            TokenTxKind::Transfer,
            TokenTxKind::Mint,
            TokenTxKind::Approval,
            TokenTxKind::Transfer,
        ];
        for (i, kind) in kinds.iter().enumerate() {
            let mut ttx = make_test_token_transaction(10 + i as u64, i as u32, *kind);
            if i == 3 {
                ttx.standard = TokenStandard::Erc721;
                ttx.token_id = Some(U256::from(77u64));
            }
            store.store_token_transaction(&ttx).unwrap();
        }

        let transfers = ListQuery::TokenTransactions(TokenTransactionFilter {
            kinds: vec![TokenTxKind::Transfer, TokenTxKind::Mint],
            ..Default::default()
        });
        assert_eq!(store.count(&transfers).unwrap(), 3);

        let nft = ListQuery::TokenTransactions(TokenTransactionFilter {
            standard: Some(TokenStandard::Erc721),
            token_id: Some(U256::from(77u64)),
            ..Default::default()
        });
        let rows = store.scan(&nft, older(None, 10)).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0].1, ListKey::TokenTransaction(k) if k.log_index == 3));

        let stranger = ListQuery::TokenTransactions(TokenTransactionFilter {
            account: Some(Address::repeat_byte(0xee)),
            ..Default::default()
        });
        assert_eq!(store.count(&stranger).unwrap(), 0);
    }

    #[test]
    fn test_token_contracts_by_activity_and_assets() {
        let store = SqliteStore::in_memory().unwrap();
        let busy = Address::repeat_byte(0x71);
        let quiet = Address::repeat_byte(0x72);
        let nft = Address::repeat_byte(0x73);
        let owner = Address::repeat_byte(0x0a);

        let mut log_index = 0;
        let mut store_ttx = |block: u64, token: Address, standard: TokenStandard, sender: Address| {
            let mut ttx = make_test_token_transaction(block, log_index, TokenTxKind::Transfer);
            ttx.transaction_hash = B256::repeat_byte(0x90 + log_index as u8);
            ttx.token = token;
            ttx.standard = standard;
            ttx.sender = sender;
            log_index += 1;
            store.store_token_transaction(&ttx).unwrap();
        };
        store_ttx(1, quiet, TokenStandard::Erc20, owner);
        store_ttx(2, busy, TokenStandard::Erc20, Address::repeat_byte(0x01));
        store_ttx(3, busy, TokenStandard::Erc20, owner);
        store_ttx(4, busy, TokenStandard::Erc20, Address::repeat_byte(0x01));
        store_ttx(5, nft, TokenStandard::Erc721, owner);

        let erc20 = TokenContractsQuery::ByActivity(TokenStandard::Erc20);
        assert_eq!(store.token_contracts(&erc20, 10).unwrap(), vec![busy, quiet]);
        assert_eq!(store.token_contracts(&erc20, 1).unwrap(), vec![busy]);
        assert_eq!(
            store
                .token_contracts(&TokenContractsQuery::ByActivity(TokenStandard::Erc721), 10)
                .unwrap(),
            vec![nft]
        );
        assert!(store
            .token_contracts(&TokenContractsQuery::ByActivity(TokenStandard::Erc1155), 10)
            .unwrap()
            .is_empty());

        let assets = TokenContractsQuery::Assets {
            standard: TokenStandard::Erc20,
            owner,
        };
        // busy was touched in block 3, quiet in block 1
        assert_eq!(store.token_contracts(&assets, 10).unwrap(), vec![busy, quiet]);
    }

    #[test]
    fn test_last_known_block_metadata() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.last_known_block().unwrap(), None);
        store.set_last_known_block(42).unwrap();
        store.set_last_known_block(43).unwrap();
        assert_eq!(store.last_known_block().unwrap(), Some(43));
    }

    /// Tests persistence across store instances (simulating restart).
    #[test]
    fn test_persistence_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("opera-api.sqlite");

        {
            let store = SqliteStore::new(&db_path).unwrap();
            for i in 0..5 {
                store.store_block(&make_test_block(i)).unwrap();
            }
            store.set_last_known_block(4).unwrap();
        }

        let store = SqliteStore::new(&db_path).unwrap();
        assert_eq!(store.last_known_block().unwrap(), Some(4));
        assert!(store.block(3).unwrap().is_some());
        assert_eq!(store.count(&ListQuery::Blocks).unwrap(), 5);
    }
}

// ==================== Model-based tests ====================
#[cfg(test)]
mod model_tests {
    use super::tests::{make_test_token_transaction, make_test_transaction};
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashMap};

    fn token_key(block: u64, log_index: u32, position: u32) -> TokenTxKey {
        TokenTxKey {
            transaction_hash: B256::from(U256::from(block)),
            log_index,
            position,
        }
    }

    fn arb_token_positions() -> impl Strategy<Value = BTreeSet<(u64, u32, u32)>> {
        let block = prop_oneof![0..4u64, any::<u32>().prop_map(u64::from)];
        let field = prop_oneof![0..3u32, 4090..4100u32, any::<u32>()];
        proptest::collection::btree_set((block, field.clone(), field), 0..40)
    }

    #[derive(Debug, Clone)]
    enum Operation {
        StorePending { tx: u8 },
        StoreMined { tx: u8, block: u64, index: u32 },
        Get { tx: u8 },
    }

    fn arb_operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            (0..8u8).prop_map(|tx| Operation::StorePending { tx }),
            (0..8u8, 0..4u64, 0..3u32)
                .prop_map(|(tx, block, index)| Operation::StoreMined { tx, block, index }),
            (0..8u8).prop_map(|tx| Operation::Get { tx }),
        ]
    }

    proptest! {
        /// The store behaves like a map where block linkage is written once.
        #[test]
        fn prop_transaction_store_matches_model(
            operations in proptest::collection::vec(arb_operation(), 1..40)
        ) {
            let store = SqliteStore::in_memory().unwrap();
            let mut model: HashMap<u8, StoredTransaction> = HashMap::new();

            for op in operations {
                match op {
                    Operation::StorePending { tx } => {
                        let record = make_test_transaction(B256::repeat_byte(tx), None);
                        let result = store.store_transaction(&record);
                        prop_assert!(result.is_ok());
                        model.entry(tx).or_insert(record);
                    }
                    Operation::StoreMined { tx, block, index } => {
                        let record = make_test_transaction(B256::repeat_byte(tx), Some((block, index)));
                        let result = store.store_transaction(&record);
                        match model.get(&tx) {
                            Some(current) if current.block.is_some() && current.block != record.block => {
                                prop_assert!(matches!(result, Err(RepositoryError::Conflict(_))));
                            }
                            _ => {
                                prop_assert!(result.is_ok());
                                model.insert(tx, record);
                            }
                        }
                    }
                    Operation::Get { tx } => {
                        let stored = store.transaction(B256::repeat_byte(tx)).unwrap();
                        prop_assert_eq!(stored.as_ref(), model.get(&tx));
                    }
                }
            }
        }

        /// Paging the token list in fixed steps visits every row exactly once,
        /// newest first, whatever the log index and batch position.
        #[test]
        fn prop_token_scan_pages_cover_every_position(
            positions in arb_token_positions(),
            step in 1usize..6,
        ) {
            let store = SqliteStore::in_memory().unwrap();
            for &(block, log_index, position) in &positions {
                let mut ttx = make_test_token_transaction(block, log_index, TokenTxKind::Transfer);
                ttx.transaction_hash = token_key(block, log_index, position).transaction_hash;
                ttx.position = position;
                prop_assert!(store.store_token_transaction(&ttx).is_ok());
            }

            let query = ListQuery::TokenTransactions(TokenTransactionFilter::default());
            prop_assert_eq!(store.count(&query).unwrap(), positions.len() as u64);

            let expected: Vec<ListKey> = positions
                .iter()
                .rev()
                .map(|&(block, log_index, position)| {
                    ListKey::TokenTransaction(token_key(block, log_index, position))
                })
                .collect();

            let mut seen = Vec::new();
            let mut anchor = None;
            loop {
                let rows = store
                    .scan(&query, ScanRange { anchor, direction: ScanDirection::Older, limit: step })
                    .unwrap();
                let Some(&(last, _)) = rows.last() else {
                    break;
                };
                for (ordinal, key) in rows {
                    prop_assert!(store.contains(&query, ordinal).unwrap());
                    seen.push(key);
                }
                anchor = Some(last);
            }
            prop_assert_eq!(seen, expected);
        }
    }
}
