//! Event topic table and token log handlers.
//!
//! The dispatcher classifies a log record by its first topic. A
//! [`TopicTable`] maps known event signature hashes to a [`LogHandler`] that
//! decodes the record into token transactions. The table is built once and
//! never changes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use alloy_sol_types::{sol, SolEvent};
use opera_chain_index::{
    RawLog, Repository, RepositoryError, RepositoryResult, StoredBlock, StoredTransaction,
    TokenStandard, TokenTransaction, TokenTxKind,
};

sol! {
    interface IErc20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);
    }

    interface IErc721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
        event Approval(address indexed owner, address indexed approved, uint256 indexed tokenId);
        event ApprovalForAll(address indexed owner, address indexed operator, bool approved);
    }

    interface IErc1155 {
        event TransferSingle(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 id,
            uint256 value
        );
        event TransferBatch(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256[] ids,
            uint256[] values
        );
    }
}

/// A log record together with the block and transaction it belongs to.
#[derive(Clone, Copy)]
pub struct LogContext<'a> {
    pub log: &'a RawLog,
    pub block: &'a StoredBlock,
    pub transaction: &'a StoredTransaction,
}

impl LogContext<'_> {
    /// Token transaction skeleton for this record.
    fn token_transaction(
        &self,
        standard: TokenStandard,
        kind: TokenTxKind,
        position: u32,
    ) -> TokenTransaction {
        TokenTransaction {
            transaction_hash: self.transaction.hash,
            log_index: self.log.log_index,
            position,
            block_number: self.block.number,
            token: self.log.address,
            standard,
            kind,
            sender: Default::default(),
            recipient: Default::default(),
            amount: U256::ZERO,
            token_id: None,
            timestamp: self.block.timestamp,
        }
    }
}

/// Decodes a classified log record into token transactions.
pub trait LogHandler: Send + Sync {
    fn decode(
        &self,
        ctx: &LogContext<'_>,
        repo: &Repository,
    ) -> RepositoryResult<Vec<TokenTransaction>>;
}

impl<F> LogHandler for F
where
    F: Fn(&LogContext<'_>, &Repository) -> RepositoryResult<Vec<TokenTransaction>> + Send + Sync,
{
    fn decode(
        &self,
        ctx: &LogContext<'_>,
        repo: &Repository,
    ) -> RepositoryResult<Vec<TokenTransaction>> {
        self(ctx, repo)
    }
}

/// Immutable mapping from event signature hash to handler.
#[derive(Clone)]
pub struct TopicTable {
    handlers: Arc<HashMap<B256, Arc<dyn LogHandler>>>,
}

impl fmt::Debug for TopicTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicTable")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TopicTable {
    pub fn builder() -> TopicTableBuilder {
        TopicTableBuilder::default()
    }

    /// Table of the ERC-20, ERC-721 and ERC-1155 events.
    pub fn standard() -> Self {
        Self::builder()
            .with(IErc20::Transfer::SIGNATURE_HASH, handle_transfer)
            .with(IErc20::Approval::SIGNATURE_HASH, handle_approval)
            .with(IErc721::ApprovalForAll::SIGNATURE_HASH, handle_approval_for_all)
            .with(IErc1155::TransferSingle::SIGNATURE_HASH, handle_transfer_single)
            .with(IErc1155::TransferBatch::SIGNATURE_HASH, handle_transfer_batch)
            .build()
    }

    pub fn handler(&self, topic: &B256) -> Option<&Arc<dyn LogHandler>> {
        self.handlers.get(topic)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers before freezing them into a [`TopicTable`].
#[derive(Default)]
pub struct TopicTableBuilder {
    handlers: HashMap<B256, Arc<dyn LogHandler>>,
}

impl TopicTableBuilder {
    /// Register `handler` for `topic`, replacing any earlier registration.
    pub fn with(mut self, topic: B256, handler: impl LogHandler + 'static) -> Self {
        self.handlers.insert(topic, Arc::new(handler));
        self
    }

    pub fn build(self) -> TopicTable {
        TopicTable {
            handlers: Arc::new(self.handlers),
        }
    }
}

fn decode_failed(event: &str, err: alloy_sol_types::Error) -> RepositoryError {
    RepositoryError::Decode(format!("{event}: {err}"))
}

/// `Transfer` shares its signature between ERC-20 (value in data) and
/// ERC-721 (token id as fourth topic).
fn handle_transfer(
    ctx: &LogContext<'_>,
    _repo: &Repository,
) -> RepositoryResult<Vec<TokenTransaction>> {
    let log = ctx.log;
    if log.topics.len() == 4 {
        let event = IErc721::Transfer::decode_raw_log(log.topics.as_slice(), &log.data, true)
            .map_err(|e| decode_failed("ERC721 Transfer", e))?;
        let mut ttx = ctx.token_transaction(
            TokenStandard::Erc721,
            TokenTxKind::of_transfer(event.from, event.to),
            0,
        );
        ttx.sender = event.from;
        ttx.recipient = event.to;
        ttx.amount = U256::from(1u8);
        ttx.token_id = Some(event.tokenId);
        return Ok(vec![ttx]);
    }

    let event = IErc20::Transfer::decode_raw_log(log.topics.as_slice(), &log.data, true)
        .map_err(|e| decode_failed("ERC20 Transfer", e))?;
    let mut ttx = ctx.token_transaction(
        TokenStandard::Erc20,
        TokenTxKind::of_transfer(event.from, event.to),
        0,
    );
    ttx.sender = event.from;
    ttx.recipient = event.to;
    ttx.amount = event.value;
    Ok(vec![ttx])
}

fn handle_approval(
    ctx: &LogContext<'_>,
    _repo: &Repository,
) -> RepositoryResult<Vec<TokenTransaction>> {
    let log = ctx.log;
    if log.topics.len() == 4 {
        let event = IErc721::Approval::decode_raw_log(log.topics.as_slice(), &log.data, true)
            .map_err(|e| decode_failed("ERC721 Approval", e))?;
        let mut ttx = ctx.token_transaction(TokenStandard::Erc721, TokenTxKind::Approval, 0);
        ttx.sender = event.owner;
        ttx.recipient = event.approved;
        ttx.amount = U256::from(1u8);
        ttx.token_id = Some(event.tokenId);
        return Ok(vec![ttx]);
    }

    let event = IErc20::Approval::decode_raw_log(log.topics.as_slice(), &log.data, true)
        .map_err(|e| decode_failed("ERC20 Approval", e))?;
    let mut ttx = ctx.token_transaction(TokenStandard::Erc20, TokenTxKind::Approval, 0);
    ttx.sender = event.owner;
    ttx.recipient = event.spender;
    ttx.amount = event.value;
    Ok(vec![ttx])
}

/// ERC-721 and ERC-1155 share `ApprovalForAll`; contracts already seen
/// emitting ERC-1155 transfers are attributed to ERC-1155.
fn handle_approval_for_all(
    ctx: &LogContext<'_>,
    repo: &Repository,
) -> RepositoryResult<Vec<TokenTransaction>> {
    let log = ctx.log;
    let event = IErc721::ApprovalForAll::decode_raw_log(log.topics.as_slice(), &log.data, true)
        .map_err(|e| decode_failed("ApprovalForAll", e))?;

    let standard = match repo.token_standard(log.address)? {
        Some(TokenStandard::Erc1155) => TokenStandard::Erc1155,
        _ => TokenStandard::Erc721,
    };
    let mut ttx = ctx.token_transaction(standard, TokenTxKind::ApprovalForAll, 0);
    ttx.sender = event.owner;
    ttx.recipient = event.operator;
    ttx.amount = U256::from(u8::from(event.approved));
    Ok(vec![ttx])
}

fn handle_transfer_single(
    ctx: &LogContext<'_>,
    _repo: &Repository,
) -> RepositoryResult<Vec<TokenTransaction>> {
    let log = ctx.log;
    let event = IErc1155::TransferSingle::decode_raw_log(log.topics.as_slice(), &log.data, true)
        .map_err(|e| decode_failed("TransferSingle", e))?;

    let mut ttx = ctx.token_transaction(
        TokenStandard::Erc1155,
        TokenTxKind::of_transfer(event.from, event.to),
        0,
    );
    ttx.sender = event.from;
    ttx.recipient = event.to;
    ttx.amount = event.value;
    ttx.token_id = Some(event.id);
    Ok(vec![ttx])
}

/// One token transaction per batch item, keyed by its batch position.
fn handle_transfer_batch(
    ctx: &LogContext<'_>,
    _repo: &Repository,
) -> RepositoryResult<Vec<TokenTransaction>> {
    let log = ctx.log;
    let event = IErc1155::TransferBatch::decode_raw_log(log.topics.as_slice(), &log.data, true)
        .map_err(|e| decode_failed("TransferBatch", e))?;

    if event.ids.len() != event.values.len() {
        return Err(RepositoryError::Decode(format!(
            "TransferBatch: {} ids but {} values",
            event.ids.len(),
            event.values.len()
        )));
    }

    let kind = TokenTxKind::of_transfer(event.from, event.to);
    event
        .ids
        .iter()
        .zip(&event.values)
        .enumerate()
        .map(|(position, (id, value))| {
            let position = u32::try_from(position).map_err(|_| {
                RepositoryError::Decode("TransferBatch: too many items".to_string())
            })?;
            let mut ttx = ctx.token_transaction(TokenStandard::Erc1155, kind, position);
            ttx.sender = event.from;
            ttx.recipient = event.to;
            ttx.amount = *value;
            ttx.token_id = Some(*id);
            Ok(ttx)
        })
        .collect()
}
