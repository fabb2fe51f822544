//! Wallet, transaction construction, the pending-transaction pool, and a
//! file-based encrypted keystore for the raw secp256k1 secret.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use kndchain_consensus::balance;
use kndchain_core::constants::{MINING_REWARD, REWARD_INPUT_ADDRESS};
use kndchain_core::{Address, Block, CryptoProvider, Input, PoolError, Transaction, TransactionError};
use parking_lot::RwLock;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

// --- Wallet ------------------------------------------------------------

/// Holds a decrypted private key in memory for the lifetime of the
/// process. The balance it reports is computed against whatever chain
/// snapshot the caller hands in, rather than a reference the wallet
/// captures itself — the same explicit-chain-passing fix the validator
/// uses to avoid the "listing" cycle.
pub struct Wallet {
    pub address: Address,
    private_key: [u8; 32],
    crypto: Arc<dyn CryptoProvider>,
}

impl Wallet {
    pub fn new(private_key: [u8; 32], address: Address, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            address,
            private_key,
            crypto,
        }
    }

    pub fn balance(&self, chain: &[Block]) -> u64 {
        let upper = chain.len() as i64 - 1;
        balance(&self.address, chain, upper)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TransactionError> {
        self.crypto
            .sign(&self.private_key, message)
            .map_err(|_| TransactionError::InvalidSignature)
    }
}

/// `sign_input`: signs `H(output)` and records the input
/// fields the validator checks.
fn sign_input(wallet: &Wallet, output: &BTreeMap<Address, u64>) -> Result<Input, TransactionError> {
    let message = kndchain_core::canonical_hash(&[output]);
    let signature = wallet.sign(message.as_bytes())?;
    Ok(Input {
        timestamp: now_ms(),
        amount: 0, // filled in by the caller, which knows the wallet's balance
        address: wallet.address.clone(),
        signature: hex::encode(signature),
    })
}

/// `create(senderWallet, receiver, amount)`.
pub fn create_transaction(
    wallet: &Wallet,
    chain: &[Block],
    receiver: &Address,
    amount: u64,
) -> Result<Transaction, TransactionError> {
    let sender_balance = wallet.balance(chain);
    if amount > sender_balance {
        return Err(TransactionError::AmountExceedsBalance);
    }
    let mut output = BTreeMap::new();
    output.insert(receiver.clone(), amount);
    output.insert(wallet.address.clone(), sender_balance - amount);

    let mut input = sign_input(wallet, &output)?;
    input.amount = sender_balance;

    Ok(Transaction {
        id: Uuid::new_v4(),
        input,
        output,
    })
}

/// `append(tx, senderWallet, receiver, amount)`. Preserves
/// `tx.id` and re-signs the input over the updated output.
pub fn append_transaction(
    tx: &Transaction,
    wallet: &Wallet,
    receiver: &Address,
    amount: u64,
) -> Result<Transaction, TransactionError> {
    let current = *tx.output.get(&wallet.address).unwrap_or(&0);
    if amount > current {
        return Err(TransactionError::AmountExceedsBalance);
    }
    let mut output = tx.output.clone();
    *output.entry(receiver.clone()).or_insert(0) += amount;
    output.insert(wallet.address.clone(), current - amount);

    let mut input = sign_input(wallet, &output)?;
    input.amount = tx.input.amount;

    Ok(Transaction {
        id: tx.id,
        input,
        output,
    })
}

/// Reward transaction: unsigned by design, skipping
/// signature verification entirely.
pub fn reward_transaction(miner_address: &Address) -> Transaction {
    let mut output = BTreeMap::new();
    output.insert(miner_address.clone(), MINING_REWARD);
    Transaction {
        id: Uuid::new_v4(),
        input: Input {
            timestamp: 0,
            amount: 0,
            address: Address::from(REWARD_INPUT_ADDRESS),
            signature: String::new(),
        },
        output,
    }
}

// --- TransactionPool ----------------------------------------

#[derive(Default)]
pub struct TransactionPool {
    transactions: RwLock<HashMap<Uuid, Transaction>>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tx: Transaction) -> Result<(), PoolError> {
        self.transactions.write().insert(tx.id, tx);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Transaction> {
        self.transactions.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Transaction> {
        self.transactions.read().values().cloned().collect()
    }

    pub fn has_sender(&self, address: &Address) -> bool {
        self.transactions
            .read()
            .values()
            .any(|t| &t.input.address == address)
    }

    pub fn get_by_sender(&self, address: &Address) -> Option<Transaction> {
        self.transactions
            .read()
            .values()
            .find(|t| &t.input.address == address)
            .cloned()
    }

    /// Transactions passing validity. Reward transactions (unsigned
    /// by design) never legitimately sit in the pool, so every entry here
    /// goes through the non-reward check.
    pub fn valid_transactions(&self, crypto: &dyn CryptoProvider) -> Vec<Transaction> {
        self.transactions
            .read()
            .values()
            .filter(|t| kndchain_consensus::validate_transaction(t, crypto).is_ok())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.transactions.write().clear();
    }

    pub fn drain_committed(&self, chain: &[Block]) {
        let committed: HashSet<Uuid> = chain
            .iter()
            .flat_map(|b| b.data.iter().map(|t| t.id))
            .collect();
        self.transactions
            .write()
            .retain(|id, _| !committed.contains(id));
    }

    pub fn replace(&self, snapshot: HashMap<Uuid, Transaction>) {
        *self.transactions.write() = snapshot;
    }
}

// --- Encrypted keystore ---------------------------------------

/// File-based keystore, one file per address under `{keysDir}/{pubKeyHex}`.
/// The private key is encrypted at rest with AES-256-GCM, the key
/// derived from the unlock password via PBKDF2-HMAC-SHA256 — the same
/// construction used elsewhere in this stack for secrets-at-rest,
/// strengthening rather than narrowing the wire format's "raw 32-byte
/// private key" contract (the unlocked bytes handed to the rest of the
/// system are still exactly that).
pub struct Keystore {
    root: PathBuf,
}

impl Keystore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, address: &Address) -> PathBuf {
        self.root.join(address.as_str())
    }

    pub fn store(&self, address: &Address, private_key: &[u8; 32], password: &str) -> std::io::Result<()> {
        let (ciphertext, nonce) = encrypt_secret(private_key, password);
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        fs::write(self.path_for(address), blob)
    }

    pub fn load(&self, address: &Address, password: &str) -> anyhow::Result<[u8; 32]> {
        let blob = fs::read(self.path_for(address))?;
        if blob.len() < 12 {
            anyhow::bail!("keystore entry for {address} is truncated");
        }
        let (nonce_bytes, salted_ciphertext) = blob.split_at(12);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(nonce_bytes);
        decrypt_secret(salted_ciphertext, &nonce, password)
    }

    pub fn addresses(&self) -> std::io::Result<Vec<Address>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(Address::from(name.to_string()));
                }
            }
        }
        Ok(out)
    }
}

fn derive_key(password: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, 10_000, &mut key);
    key
}

fn encrypt_secret(secret: &[u8; 32], password: &str) -> (Vec<u8>, [u8; 12]) {
    let mut salt = [0u8; 16];
    AeadOsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key is always valid for AES-256");
    let mut nonce_bytes = [0u8; 12];
    AeadOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut ciphertext = cipher
        .encrypt(nonce, secret.as_slice())
        .expect("encryption with a freshly generated nonce never fails");
    let mut out = salt.to_vec();
    out.append(&mut ciphertext);
    (out, nonce_bytes)
}

fn decrypt_secret(
    salted_ciphertext: &[u8],
    nonce: &[u8; 12],
    password: &str,
) -> anyhow::Result<[u8; 32]> {
    if salted_ciphertext.len() < 16 {
        anyhow::bail!("ciphertext too short");
    }
    let (salt, ct) = salted_ciphertext.split_at(16);
    let mut salt_arr = [0u8; 16];
    salt_arr.copy_from_slice(salt);
    let key = derive_key(password, &salt_arr);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key is always valid for AES-256");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| anyhow::anyhow!("failed to decrypt keystore entry (wrong password?)"))?;
    if plaintext.len() != 32 {
        anyhow::bail!("decrypted secret has unexpected length");
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kndchain_crypto::{generate_keypair, Secp256k1Provider};

    fn wallet_with_balance() -> (Wallet, Arc<dyn CryptoProvider>) {
        let kp = generate_keypair();
        let crypto: Arc<dyn CryptoProvider> = Arc::new(Secp256k1Provider::new());
        (Wallet::new(kp.private_key, kp.address, crypto.clone()), crypto)
    }

    // a freshly created transaction balances its outputs and signs cleanly
    #[test]
    fn create_transaction_balances_and_signs() {
        let (wallet, crypto) = wallet_with_balance();
        let receiver = Address::from("receiver-address");
        let tx = create_transaction(&wallet, &[], &receiver, 100).unwrap();

        let total: u64 = tx.output.values().sum();
        assert_eq!(total, wallet.balance(&[]));

        let sig = hex::decode(&tx.input.signature).unwrap();
        let message = tx.output_hash();
        assert!(crypto
            .verify(&wallet.address, message.as_bytes(), &sig)
            .unwrap());
    }

    #[test]
    fn create_transaction_rejects_amount_exceeding_balance() {
        let (wallet, _crypto) = wallet_with_balance();
        let receiver = Address::from("receiver-address");
        let err = create_transaction(&wallet, &[], &receiver, wallet.balance(&[]) + 1).unwrap_err();
        assert_eq!(err, TransactionError::AmountExceedsBalance);
    }

    // appending to a transaction preserves its id and re-signs the input
    #[test]
    fn append_preserves_id_and_resigns() {
        let (wallet, _crypto) = wallet_with_balance();
        let r1 = Address::from("r1");
        let r2 = Address::from("r2");
        let t1 = create_transaction(&wallet, &[], &r1, 100).unwrap();
        let t2 = append_transaction(&t1, &wallet, &r2, 50).unwrap();

        assert_eq!(t2.id, t1.id);
        assert_eq!(t2.output[&r1], 100);
        assert_eq!(t2.output[&r2], 50);
        assert_eq!(t2.output[&wallet.address], wallet.balance(&[]) - 150);
        assert_ne!(t2.input.signature, t1.input.signature);
    }

    #[test]
    fn reward_transaction_has_sentinel_input_and_no_signature() {
        let miner = Address::from("miner-address");
        let tx = reward_transaction(&miner);
        assert!(tx.is_reward());
        assert!(tx.input.signature.is_empty());
        assert_eq!(tx.output[&miner], MINING_REWARD);
    }

    // committed transactions disappear from the pool, pending ones remain
    #[test]
    fn drain_committed_removes_transactions_found_in_chain() {
        let pool = TransactionPool::new();
        let miner = Address::from("miner-address");
        let committed = reward_transaction(&miner);
        let pending = reward_transaction(&miner);
        pool.add(committed.clone()).unwrap();
        pool.add(pending.clone()).unwrap();

        let mut block = Block::genesis();
        block.data = vec![committed.clone()];
        pool.drain_committed(&[block]);

        assert!(pool.get(committed.id).is_none());
        assert!(pool.get(pending.id).is_some());
    }

    #[test]
    fn keystore_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("kndchain-wallet-test-{}", Uuid::new_v4()));
        let keystore = Keystore::new(dir).unwrap();
        let kp = generate_keypair();
        keystore.store(&kp.address, &kp.private_key, "hunter2").unwrap();
        let recovered = keystore.load(&kp.address, "hunter2").unwrap();
        assert_eq!(recovered, kp.private_key);
    }
}
