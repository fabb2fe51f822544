//! Wires the chain store, wallet, consensus and pub/sub peer into a
//! running node: config load, tracing init, startup sync, the
//! mining loop (run as a blocking task since PoW search is CPU-bound),
//! and the gossipsub receive loop.

use anyhow::{Context, Result};
use kndchain_config::NodeConfig;
use kndchain_consensus::mine_new_block_cancellable;
use kndchain_core::{Block, ChainStore, CryptoProvider, InMemoryChainStore};
use kndchain_crypto::{generate_keypair, Secp256k1Provider};
use kndchain_network::{pubsub::PubSubPeer, sync};
use kndchain_wallet::{reward_transaction, TransactionPool, Wallet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// The pieces a running node (or a one-shot CLI operation) needs: chain
/// store, pending-transaction pool, crypto provider and a mining wallet.
/// Kept as `Arc`s so the miner task, the receive task, and CLI callers
/// can all share them without taking ownership.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<dyn ChainStore>,
    pub pool: Arc<TransactionPool>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub wallet: Wallet,
}

impl Node {
    /// Builds a node's in-memory state from configuration. Wallet/crypto
    /// constructor failures here are fatal at startup.
    pub fn bootstrap(config: NodeConfig) -> Result<Self> {
        let genesis = Block {
            timestamp: 0,
            last_hash: config.genesis.last_hash.clone(),
            hash: config.genesis.hash.clone(),
            data: Vec::new(),
            nonce: config.genesis.nonce,
            difficulty: config.genesis.difficulty,
        };
        let store: Arc<dyn ChainStore> = Arc::new(InMemoryChainStore::from_chain(vec![genesis]));
        let pool = Arc::new(TransactionPool::new());
        let crypto: Arc<dyn CryptoProvider> = Arc::new(Secp256k1Provider::new());

        let keypair = generate_keypair();
        let wallet = Wallet::new(keypair.private_key, keypair.address, crypto.clone());

        Ok(Self {
            config,
            store,
            pool,
            crypto,
            wallet,
        })
    }

    /// One-shot startup sync against the configured beacon, if any.
    /// Failures are logged, not fatal.
    pub async fn sync_from_beacon(&self) {
        let Some(beacon) = &self.config.beacon_url else {
            return;
        };
        let blocks_url = format!("{beacon}/api/blocks");
        if let Err(e) = sync::sync_blockchain(&blocks_url, self.store.as_ref(), self.crypto.as_ref()).await {
            sync::log_sync_failure("startup chain sync", &e);
        }
        let txs_url = format!("{beacon}/api/transactions");
        if let Err(e) = sync::sync_transaction_pool(&txs_url, &self.pool).await {
            sync::log_sync_failure("startup pool sync", &e);
        }
    }

    /// One full miner round: gather valid
    /// pending transactions, append the reward transaction, mine, commit
    /// locally, and clear the pool. Broadcasting is the caller's job,
    /// since only a connected peer can do it.
    pub fn mine_round(&self, cancel: Option<&AtomicBool>) -> Option<Block> {
        let mut data = self.pool.valid_transactions(self.crypto.as_ref());
        data.push(reward_transaction(&self.wallet.address));
        let last_block = self.store.last_block();
        let block = mine_new_block_cancellable(&last_block, data, cancel)?;
        if let Err(e) = self.store.add_block(block.clone()) {
            error!(error = %e, "failed to persist newly mined block");
            return None;
        }
        self.pool.clear();
        Some(block)
    }
}

/// Runs a node until the process receives a shutdown signal.
pub async fn run_node(config_path: PathBuf) -> Result<()> {
    init_logging();
    let config = NodeConfig::load(&config_path).with_context(|| {
        format!("loading node config from {}", config_path.display())
    })?;
    info!(path = %config_path.display(), "starting kndchain node");

    let node = Arc::new(Node::bootstrap(config)?);
    node.sync_from_beacon().await;

    let mut peer = PubSubPeer::connect(&node.config.pubsub_addr)
        .context("failed to start pub/sub peer")?;
    let mining_cancel = Arc::new(AtomicBool::new(false));
    peer.subscribe_peers(
        node.store.clone(),
        node.pool.clone(),
        node.crypto.clone(),
        Some(mining_cancel.clone()),
    )
    .context("failed to subscribe to pub/sub channels")?;
    let peer = Arc::new(tokio::sync::Mutex::new(peer));

    if node.config.mining_enabled {
        let node = node.clone();
        let peer = peer.clone();
        let mining_cancel = mining_cancel.clone();
        tokio::spawn(async move {
            loop {
                mining_cancel.store(false, Ordering::Relaxed);
                let node_for_round = node.clone();
                let cancel_for_round = mining_cancel.clone();
                let mined = tokio::task::spawn_blocking(move || {
                    node_for_round.mine_round(Some(cancel_for_round.as_ref()))
                })
                .await;
                match mined {
                    Ok(Some(block)) => {
                        info!(hash = %block.hash, difficulty = block.difficulty, "mined new block");
                        let chain = node.store.blockchain();
                        let mut guard = peer.lock().await;
                        if let Err(e) = guard.broadcast_blockchain(&chain) {
                            warn!(error = %e, "failed to broadcast newly mined chain");
                        }
                    }
                    Ok(None) => {
                        // Search was cancelled by an incoming chain; loop restarts against the new head.
                    }
                    Err(e) => error!(error = %e, "mining task panicked"),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
