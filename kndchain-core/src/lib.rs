//! Shared data model for a kndchain node: the canonical hasher, the
//! transaction/block/chain types, the chain store seam, and the error
//! taxonomy every other crate in the workspace builds on.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod constants {
    /// Target inter-block interval, in milliseconds.
    pub const MINE_RATE: u64 = 10_000;
    pub const MINING_REWARD: u64 = 5;
    pub const INITIAL_BALANCE: u64 = 1000;
    pub const REWARD_INPUT_ADDRESS: &str = "MINER_REWARD";

    pub const DEFAULT_GENESIS_LAST_HASH: &str = "0x000";
    pub const DEFAULT_GENESIS_HASH: &str = "0x000";
    pub const DEFAULT_GENESIS_DIFFICULTY: u64 = 3;
    pub const DEFAULT_GENESIS_NONCE: u64 = 0;
}

/// Hex encoding of a secp256k1 public key, used as wallet identifier and
/// transaction recipient key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn reward_sentinel() -> Self {
        Address(constants::REWARD_INPUT_ADDRESS.to_string())
    }

    pub fn is_reward_sentinel(&self) -> bool {
        self.0 == constants::REWARD_INPUT_ADDRESS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Address(s)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

/// Hex-encoded SHA-256 digest.
pub type Hash = String;

pub type TransactionId = Uuid;

// --- Canonical hashing ---------------------------------------

/// Something that can be rendered to the deterministic textual form the
/// hasher sorts and concatenates. Top-level arguments to `canonical_hash`
/// implement this; the hasher never looks inside a sequence or map beyond
/// what `Serialize`/`Ord` already make deterministic.
pub trait Canonical {
    fn canonical_bytes(&self) -> Vec<u8>;
}

impl Canonical for u64 {
    fn canonical_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Canonical for str {
    fn canonical_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Canonical for String {
    fn canonical_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Canonical for Address {
    fn canonical_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl Canonical for BTreeMap<Address, u64> {
    fn canonical_bytes(&self) -> Vec<u8> {
        // BTreeMap already iterates in key order, giving map-valued
        // arguments a deterministic key-sorted textual form for free.
        serde_json::to_vec(self).expect("map of plain types never fails to serialize")
    }
}

impl Canonical for [Transaction] {
    fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transactions always serialize")
    }
}

impl Canonical for Vec<Transaction> {
    fn canonical_bytes(&self) -> Vec<u8> {
        self.as_slice().canonical_bytes()
    }
}

/// `H(x1, ..., xn)`: canonicalize each argument, sort the resulting byte
/// strings lexicographically, concatenate, hash. Permutation-invariant
/// over its top-level arguments by construction.
pub fn canonical_hash(parts: &[&dyn Canonical]) -> Hash {
    let mut byte_arrays: Vec<Vec<u8>> = parts.iter().map(|p| p.canonical_bytes()).collect();
    byte_arrays.sort();
    let mut hasher = Sha256::new();
    for chunk in &byte_arrays {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

pub fn hash_block(
    timestamp: u64,
    last_hash: &str,
    data: &[Transaction],
    nonce: u64,
    difficulty: u64,
) -> Hash {
    let last_hash_owned = last_hash.to_string();
    canonical_hash(&[
        &timestamp,
        &last_hash_owned,
        &data.to_vec(),
        &nonce,
        &difficulty,
    ])
}

/// Expands a hex digest to its binary expansion, most significant bit
/// first, one nibble at a time.
pub fn hex_to_binary(hex_str: &str) -> String {
    let mut out = String::with_capacity(hex_str.len() * 4);
    for c in hex_str.chars() {
        let nibble = c.to_digit(16).unwrap_or(0);
        out.push_str(match nibble {
            0x0 => "0000",
            0x1 => "0001",
            0x2 => "0010",
            0x3 => "0011",
            0x4 => "0100",
            0x5 => "0101",
            0x6 => "0110",
            0x7 => "0111",
            0x8 => "1000",
            0x9 => "1001",
            0xa => "1010",
            0xb => "1011",
            0xc => "1100",
            0xd => "1101",
            0xe => "1110",
            _ => "1111",
        });
    }
    out
}

/// Does `hash`'s binary expansion begin with `difficulty` zero bits?
pub fn meets_difficulty(hash: &str, difficulty: u64) -> bool {
    let binary = hex_to_binary(hash);
    let prefix_len = difficulty as usize;
    if prefix_len > binary.len() {
        return false;
    }
    binary[..prefix_len].chars().all(|c| c == '0')
}

// --- Transaction model -----------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    /// Epoch milliseconds.
    pub timestamp: u64,
    /// Sender's balance at the moment of signing, not the sent amount.
    pub amount: u64,
    pub address: Address,
    /// Hex-encoded signature, empty for reward transactions.
    #[serde(rename = "sig")]
    pub signature: String,
}

pub type Output = BTreeMap<Address, u64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub input: Input,
    pub output: Output,
}

impl Transaction {
    pub fn is_reward(&self) -> bool {
        self.input.address.is_reward_sentinel()
    }

    /// Canonical hash of `output`, the message the sender's signature
    /// covers.
    pub fn output_hash(&self) -> Hash {
        canonical_hash(&[&self.output])
    }
}

// --- Block & chain ----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub timestamp: u64,
    pub last_hash: Hash,
    pub hash: Hash,
    pub data: Vec<Transaction>,
    pub nonce: u64,
    pub difficulty: u64,
}

impl Block {
    pub fn genesis() -> Self {
        Block {
            timestamp: 0,
            last_hash: constants::DEFAULT_GENESIS_LAST_HASH.to_string(),
            hash: constants::DEFAULT_GENESIS_HASH.to_string(),
            data: Vec::new(),
            nonce: constants::DEFAULT_GENESIS_NONCE,
            difficulty: constants::DEFAULT_GENESIS_DIFFICULTY,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.last_hash == constants::DEFAULT_GENESIS_LAST_HASH && self.data.is_empty()
    }

    pub fn recompute_hash(&self) -> Hash {
        hash_block(
            self.timestamp,
            &self.last_hash,
            &self.data,
            self.nonce,
            self.difficulty,
        )
    }
}

// --- Error taxonomy ---------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("candidate chain is not longer than the local chain")]
    ShorterChain,
    #[error("candidate chain failed structural or economic validation")]
    InvalidChain,
    #[error("candidate chain contains invalid transactions")]
    InvalidTransactions,
    #[error("refusing to add a nil or empty block")]
    AddNilBlock,
    #[error("failed to persist transaction")]
    PersistTransaction,
    #[error("failed to persist block")]
    PersistBlock,
    #[error("failed to persist blockchain")]
    PersistBlockchain,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("sum of outputs does not equal the signed input amount")]
    InvalidOutputTotalBalance,
    #[error("signature does not verify against the input address")]
    InvalidSignature,
    #[error("input address is not a valid public key")]
    InvalidPubKey,
    #[error("requested amount exceeds sender balance")]
    AmountExceedsBalance,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewardError {
    #[error("block contains more than one reward transaction")]
    MinerRewardExceedsLimit,
    #[error("reward transaction output does not equal the mining reward")]
    InvalidMinerRewardAmount,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed public key")]
    InvalidPubKey,
    #[error("signature did not verify")]
    InvalidSignature,
}

/// Per-transaction or per-block failure surfaced by the validator.
///
/// The chain this project descends from folds every non-reward
/// transaction failure into `InvalidMinerRewardAmount`, misattributing
/// the error kind to the reward check even when the offending
/// transaction isn't a reward transaction at all. This type keeps a
/// dedicated `InvalidTransaction` variant instead of copying that bug.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    Reward(#[from] RewardError),
    #[error("non-reward transaction failed validation: {0}")]
    InvalidTransaction(TransactionError),
    #[error("sender's input amount does not match their historical balance")]
    InvalidInputBalance,
    #[error("sender address appears more than once in a single block")]
    DuplicateTransaction,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("cannot add a nil transaction to the pool")]
    NilTransaction,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("peer returned an unparsable blockchain")]
    InvalidResponse,
    #[error("no reachable peers")]
    Unreachable,
}

// --- Crypto provider seam --------------------------------------

/// Narrow capability interface for signing and verification, implemented
/// by `kndchain-crypto`. Kept as a trait object seam so the concrete curve
/// library stays swappable, following the existing split between core
/// types and backend crates.
pub trait CryptoProvider: Send + Sync {
    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn verify(&self, address: &Address, message: &[u8], signature: &[u8]) -> Result<bool, CryptoError>;
}

// --- Chain store seam ------------------------------------------

/// Owns block records exclusively. Implementations may be in-memory or
/// persistent; all must expose identical semantics, including atomicity
/// of `replace_chain` with respect to concurrent readers.
pub trait ChainStore: Send + Sync {
    fn add_block(&self, block: Block) -> Result<(), ChainError>;
    fn replace_chain(&self, chain: Vec<Block>) -> Result<(), ChainError>;
    fn block_count(&self) -> usize;
    fn last_block(&self) -> Block;
    fn get_block_by_hash(&self, hash: &str) -> Option<Block>;
    fn blockchain(&self) -> Vec<Block>;
}

struct ChainInner {
    blocks: Vec<Block>,
    by_hash: HashMap<Hash, usize>,
}

impl ChainInner {
    fn new() -> Self {
        let genesis = Block::genesis();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash.clone(), 0);
        ChainInner {
            blocks: vec![genesis],
            by_hash,
        }
    }

    fn reindex(&mut self) {
        self.by_hash.clear();
        for (i, b) in self.blocks.iter().enumerate() {
            self.by_hash.insert(b.hash.clone(), i);
        }
    }
}

/// In-memory `ChainStore`. Persistence is an external collaborator this
/// system leaves out of scope; a production deployment would swap this
/// for a disk-backed store behind the same trait.
pub struct InMemoryChainStore {
    inner: RwLock<ChainInner>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ChainInner::new()),
        }
    }

    /// Seed the store with a chain that already contains a genesis block,
    /// as when a node syncs its initial chain from a peer at startup.
    pub fn from_chain(chain: Vec<Block>) -> Self {
        let mut inner = ChainInner {
            blocks: chain,
            by_hash: HashMap::new(),
        };
        inner.reindex();
        Self {
            inner: RwLock::new(inner),
        }
    }
}

impl Default for InMemoryChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for InMemoryChainStore {
    fn add_block(&self, block: Block) -> Result<(), ChainError> {
        if block.hash.is_empty() {
            return Err(ChainError::AddNilBlock);
        }
        let mut inner = self.inner.write();
        let idx = inner.blocks.len();
        inner.by_hash.insert(block.hash.clone(), idx);
        inner.blocks.push(block);
        Ok(())
    }

    fn replace_chain(&self, chain: Vec<Block>) -> Result<(), ChainError> {
        if chain.is_empty() {
            return Err(ChainError::AddNilBlock);
        }
        let mut inner = self.inner.write();
        inner.blocks = chain;
        inner.reindex();
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    fn last_block(&self) -> Block {
        let inner = self.inner.read();
        inner
            .blocks
            .last()
            .cloned()
            .expect("chain always has at least the genesis block")
    }

    fn get_block_by_hash(&self, hash: &str) -> Option<Block> {
        let inner = self.inner.read();
        inner.by_hash.get(hash).map(|&i| inner.blocks[i].clone())
    }

    fn blockchain(&self) -> Vec<Block> {
        self.inner.read().blocks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_hash_is_permutation_invariant() {
        let a = "alpha".to_string();
        let b = "beta".to_string();
        let c = "gamma".to_string();
        let h1 = canonical_hash(&[&a, &b, &c]);
        let h2 = canonical_hash(&[&c, &a, &b]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn canonical_hash_changes_with_content() {
        let a = "alpha".to_string();
        let b = "beta".to_string();
        let h1 = canonical_hash(&[&a, &b]);
        let h2 = canonical_hash(&[&a, &"gamma".to_string()]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn hex_to_binary_preserves_leading_zero_nibbles() {
        assert_eq!(hex_to_binary("0f"), "00001111");
        assert_eq!(hex_to_binary("a0"), "10100000");
    }

    #[test]
    fn meets_difficulty_checks_prefix_length() {
        let x = "x".to_string();
        let hash = canonical_hash(&[&x]);
        assert!(meets_difficulty(&hash, 0));
        assert!(!meets_difficulty(&hash, 257));
    }

    #[test]
    fn genesis_block_has_no_data() {
        let g = Block::genesis();
        assert!(g.is_genesis());
        assert!(g.data.is_empty());
    }

    #[test]
    fn add_nil_block_is_rejected_not_panicking() {
        let store = InMemoryChainStore::new();
        let mut block = Block::genesis();
        block.hash = String::new();
        assert_eq!(store.add_block(block), Err(ChainError::AddNilBlock));
    }

    #[test]
    fn replace_chain_reindexes_by_hash_lookup() {
        let store = InMemoryChainStore::new();
        let mut b1 = Block::genesis();
        b1.timestamp = 1;
        b1.last_hash = "0x000".into();
        b1.hash = "deadbeef".into();
        let new_chain = vec![Block::genesis(), b1.clone()];
        store.replace_chain(new_chain).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.get_block_by_hash("deadbeef").unwrap().timestamp, 1);
    }
}
