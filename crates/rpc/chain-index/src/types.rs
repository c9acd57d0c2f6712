//! Domain types held by the repository.
//!
//! These are the storage-facing shapes of blocks, transactions, token
//! transactions, accounts and contracts. Wire shapes of the node RPC live in
//! [`crate::node`].

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::cursor::Ordinal;

/// List ordinal of a transaction or contract deployment.
///
/// Every field keeps its full width, so distinct positions never share an
/// ordinal.
pub fn transaction_ordinal(block_number: u64, index: u32) -> Ordinal {
    (Ordinal::from(block_number) << 32) | Ordinal::from(index)
}

/// List ordinal of a token transaction: block, then log, then batch position.
pub fn token_ordinal(block_number: u64, log_index: u32, position: u32) -> Ordinal {
    (Ordinal::from(block_number) << 64) | (Ordinal::from(log_index) << 32) | Ordinal::from(position)
}

/// Block as observed from the node. Blocks are final once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    /// Block number/height.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
    /// Gas limit for this block.
    pub gas_limit: u64,
    /// Total gas used in this block.
    pub gas_used: u64,
    /// Ordered transaction hashes.
    pub transactions: Vec<B256>,
}

/// Block linkage of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLink {
    pub number: u64,
    pub hash: B256,
    /// Position of the transaction inside the block.
    pub index: u32,
    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
    pub gas_used: u64,
    /// 1 on success, 0 on failure.
    pub status: u8,
}

/// Transaction record.
///
/// Created on first observation, pending or mined. The only fields written
/// after creation are `block` and `contract_address`, and only once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub hash: B256,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    /// Address of the contract deployed by this transaction.
    pub contract_address: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas: u64,
    pub gas_price: U256,
    pub input: Bytes,
    /// `None` while pending.
    pub block: Option<BlockLink>,
}

impl StoredTransaction {
    /// A transaction is final once it is linked to a block.
    pub fn is_final(&self) -> bool {
        self.block.is_some()
    }

    /// Position in the transaction list; pending transactions are not listed.
    pub fn ordinal(&self) -> Option<Ordinal> {
        self.block
            .as_ref()
            .map(|link| transaction_ordinal(link.number, link.index))
    }

    /// Compare the fields that never change after creation.
    pub fn same_payload(&self, other: &StoredTransaction) -> bool {
        self.hash == other.hash
            && self.from == other.from
            && self.to == other.to
            && self.nonce == other.nonce
            && self.value == other.value
            && self.gas == other.gas
            && self.gas_price == other.gas_price
            && self.input == other.input
    }
}

/// Token standard of a token contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStandard {
    /// Fungible (ERC-20-like).
    Erc20,
    /// Single non-fungible (ERC-721-like).
    Erc721,
    /// Multi non-fungible (ERC-1155-like).
    Erc1155,
}

impl TokenStandard {
    pub(crate) fn code(self) -> i64 {
        match self {
            TokenStandard::Erc20 => 20,
            TokenStandard::Erc721 => 721,
            TokenStandard::Erc1155 => 1155,
        }
    }

    pub(crate) fn from_code(code: i64) -> Option<Self> {
        match code {
            20 => Some(TokenStandard::Erc20),
            721 => Some(TokenStandard::Erc721),
            1155 => Some(TokenStandard::Erc1155),
            _ => None,
        }
    }
}

impl fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenStandard::Erc20 => f.write_str("ERC20"),
            TokenStandard::Erc721 => f.write_str("ERC721"),
            TokenStandard::Erc1155 => f.write_str("ERC1155"),
        }
    }
}

/// Kind of a token transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenTxKind {
    Transfer,
    Mint,
    Burn,
    Approval,
    ApprovalForAll,
    Other,
}

impl TokenTxKind {
    /// Classify a value movement by its endpoints.
    pub fn of_transfer(sender: Address, recipient: Address) -> Self {
        if sender == Address::ZERO {
            TokenTxKind::Mint
        } else if recipient == Address::ZERO {
            TokenTxKind::Burn
        } else {
            TokenTxKind::Transfer
        }
    }

    pub(crate) fn code(self) -> i64 {
        match self {
            TokenTxKind::Transfer => 1,
            TokenTxKind::Mint => 2,
            TokenTxKind::Burn => 3,
            TokenTxKind::Approval => 4,
            TokenTxKind::ApprovalForAll => 5,
            TokenTxKind::Other => 0,
        }
    }

    pub(crate) fn from_code(code: i64) -> Self {
        match code {
            1 => TokenTxKind::Transfer,
            2 => TokenTxKind::Mint,
            3 => TokenTxKind::Burn,
            4 => TokenTxKind::Approval,
            5 => TokenTxKind::ApprovalForAll,
            _ => TokenTxKind::Other,
        }
    }
}

impl FromStr for TokenTxKind {
    type Err = String;

    /// Parse the upper snake case names used by query clients.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRANSFER" => Ok(TokenTxKind::Transfer),
            "MINT" => Ok(TokenTxKind::Mint),
            "BURN" => Ok(TokenTxKind::Burn),
            "APPROVAL" => Ok(TokenTxKind::Approval),
            "APPROVAL_FOR_ALL" => Ok(TokenTxKind::ApprovalForAll),
            "OTHER" => Ok(TokenTxKind::Other),
            other => Err(format!("unknown token transaction type '{other}'")),
        }
    }
}

/// Natural key of a token transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenTxKey {
    pub transaction_hash: B256,
    pub log_index: u32,
    /// Item index inside an ERC-1155 batch, 0 otherwise.
    pub position: u32,
}

impl fmt::Display for TokenTxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.transaction_hash, self.log_index, self.position
        )
    }
}

/// Decoded token event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub transaction_hash: B256,
    pub log_index: u32,
    pub position: u32,
    pub block_number: u64,
    /// Token contract emitting the event.
    pub token: Address,
    pub standard: TokenStandard,
    pub kind: TokenTxKind,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    /// Token id for non-fungible standards.
    pub token_id: Option<U256>,
    pub timestamp: u64,
}

impl TokenTransaction {
    pub fn key(&self) -> TokenTxKey {
        TokenTxKey {
            transaction_hash: self.transaction_hash,
            log_index: self.log_index,
            position: self.position,
        }
    }

    pub fn ordinal(&self) -> Ordinal {
        token_ordinal(self.block_number, self.log_index, self.position)
    }
}

/// Account kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    Wallet,
    Contract,
}

/// Account identity and activity metadata.
///
/// Balance and nonce are never stored; they are read live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub kind: AccountKind,
    /// Deployment transaction for contracts.
    pub deployed_by: Option<B256>,
    /// Last block the account was active in.
    pub last_activity: Option<u64>,
}

impl Account {
    /// Plain wallet account with no recorded activity.
    pub fn wallet(address: Address) -> Self {
        Self {
            address,
            kind: AccountKind::Wallet,
            deployed_by: None,
            last_activity: None,
        }
    }

    /// Contract account deployed by the given transaction.
    pub fn contract(address: Address, deployed_by: B256) -> Self {
        Self {
            address,
            kind: AccountKind::Contract,
            deployed_by: Some(deployed_by),
            last_activity: None,
        }
    }
}

/// Smart contract record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub address: Address,
    /// Deployment transaction.
    pub transaction_hash: B256,
    /// List ordinal of the deployment transaction.
    pub ordinal: Ordinal,
    /// Deployment timestamp (Unix seconds).
    pub timestamp: u64,
    pub name: String,
    pub version: String,
    pub license: String,
    pub support_contact: String,
    pub compiler: String,
    pub source_code: String,
    pub abi: String,
    /// Unix timestamp of source validation.
    pub validated: Option<u64>,
}

impl Contract {
    /// Contract deployed by a mined transaction, without metadata.
    pub fn deployed(address: Address, tx: &StoredTransaction) -> Option<Self> {
        let link = tx.block.as_ref()?;
        Some(Self {
            address,
            transaction_hash: tx.hash,
            ordinal: transaction_ordinal(link.number, link.index),
            timestamp: link.timestamp,
            ..Default::default()
        })
    }

    /// Compare the deployment fields that never change.
    pub fn same_deployment(&self, other: &Contract) -> bool {
        self.address == other.address
            && self.transaction_hash == other.transaction_hash
            && self.ordinal == other.ordinal
            && self.timestamp == other.timestamp
    }
}

/// Raw log record as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: u32,
    pub log_index: u32,
}

/// Input of a gas estimation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ordinals_follow_chain_order() {
        assert!(transaction_ordinal(10, 0) > transaction_ordinal(9, 500));
        assert!(transaction_ordinal(10, 2) > transaction_ordinal(10, 1));
    }

    #[test]
    fn test_token_ordinals_follow_log_and_batch_order() {
        assert!(token_ordinal(5, 0, 0) > token_ordinal(4, 900, 3));
        assert!(token_ordinal(5, 3, 0) > token_ordinal(5, 2, 7));
        assert!(token_ordinal(5, 3, 1) > token_ordinal(5, 3, 0));
    }

    #[test]
    fn test_ordinals_are_distinct_at_field_limits() {
        assert!(transaction_ordinal(u64::MAX, 0) > transaction_ordinal(u64::MAX - 1, u32::MAX));
        assert!(token_ordinal(7, 1, 4096) > token_ordinal(7, 1, 1));
        assert_ne!(token_ordinal(7, 1, 4096), token_ordinal(7, 1, 0));
        assert!(token_ordinal(7, 65_536, 0) > token_ordinal(7, 1, u32::MAX));
        assert!(token_ordinal(8, 0, 0) > token_ordinal(7, u32::MAX, u32::MAX));
    }

    #[test]
    fn test_transfer_kind_classification() {
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        assert_eq!(TokenTxKind::of_transfer(Address::ZERO, b), TokenTxKind::Mint);
        assert_eq!(TokenTxKind::of_transfer(a, Address::ZERO), TokenTxKind::Burn);
        assert_eq!(TokenTxKind::of_transfer(a, b), TokenTxKind::Transfer);
    }

    #[test]
    fn test_kind_codes_are_stable() {
        for kind in [
            TokenTxKind::Transfer,
            TokenTxKind::Mint,
            TokenTxKind::Burn,
            TokenTxKind::Approval,
            TokenTxKind::ApprovalForAll,
            TokenTxKind::Other,
        ] {
            assert_eq!(TokenTxKind::from_code(kind.code()), kind);
        }
        assert_eq!(
            "approval_for_all".parse::<TokenTxKind>(),
            Ok(TokenTxKind::ApprovalForAll)
        );
        assert!("SWAP".parse::<TokenTxKind>().is_err());
    }

    #[test]
    fn test_pending_transaction_has_no_ordinal() {
        let mut tx = StoredTransaction {
            hash: B256::repeat_byte(0x10),
            from: Address::repeat_byte(0x01),
            to: None,
            contract_address: None,
            nonce: 0,
            value: U256::ZERO,
            gas: 21000,
            gas_price: U256::ZERO,
            input: Bytes::new(),
            block: None,
        };
        assert!(!tx.is_final());
        assert_eq!(tx.ordinal(), None);

        tx.block = Some(BlockLink {
            number: 7,
            hash: B256::repeat_byte(0x07),
            index: 3,
            timestamp: 1000,
            gas_used: 21000,
            status: 1,
        });
        assert!(tx.is_final());
        assert_eq!(tx.ordinal(), Some(transaction_ordinal(7, 3)));
    }
}
