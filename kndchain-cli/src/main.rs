use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kndchain_config::NodeConfig;
use kndchain_core::{Address, ChainStore, InMemoryChainStore};
use kndchain_crypto::{address_from_private_key, generate_keypair, Secp256k1Provider};
use kndchain_network::{pubsub::PubSubPeer, sync, wire::ChainDto};
use kndchain_node::run_node;
use kndchain_wallet::{create_transaction, reward_transaction, Keystore, TransactionPool, Wallet};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kndchain", version, about = "kndchain peer node CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file.
    Init {
        #[arg(long, default_value = "config/kndchain.toml")]
        config: PathBuf,
    },
    /// Run the node (mining, pub/sub and sync) until interrupted.
    Node {
        #[arg(long, default_value = "config/kndchain.toml")]
        config: PathBuf,
    },
    /// Wallet operations.
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
    },
    /// Sync the chain from a beacon and print it.
    ShowChain {
        #[arg(long)]
        beacon: String,
    },
    /// Build, sign and broadcast a transaction from a locally stored wallet.
    Send {
        #[arg(long)]
        beacon: String,
        #[arg(long)]
        pubsub_addr: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },
    /// Run a single mining round against a beacon and broadcast the result.
    Mine {
        #[arg(long)]
        beacon: String,
        #[arg(long)]
        pubsub_addr: String,
        #[arg(long)]
        miner: String,
    },
}

#[derive(Subcommand)]
enum WalletCmd {
    /// Generate a keypair and store it encrypted under the keystore root.
    New {
        #[arg(long)]
        keys_dir: Option<PathBuf>,
    },
    /// List addresses held in the keystore.
    List {
        #[arg(long)]
        keys_dir: Option<PathBuf>,
    },
    /// Sync the chain from a beacon and print an address's balance.
    Balance {
        #[arg(long)]
        beacon: String,
        #[arg(long)]
        address: String,
    },
}

fn default_keys_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".kndchain")
        .join("keys")
}

fn prompt_password(prompt: &str) -> Result<String> {
    match std::env::var("KNDCHAIN_WALLET_PASSWORD") {
        Ok(p) if !p.is_empty() => Ok(p),
        _ => Ok(rpassword::prompt_password(prompt)?),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { config } => init_config(config)?,
        Commands::Node { config } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(config))?;
        }
        Commands::Wallet { cmd } => run_wallet_cmd(cmd)?,
        Commands::ShowChain { beacon } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(show_chain(&beacon))?;
        }
        Commands::Send {
            beacon,
            pubsub_addr,
            from,
            to,
            amount,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(send(&beacon, &pubsub_addr, &from, &to, amount))?;
        }
        Commands::Mine {
            beacon,
            pubsub_addr,
            miner,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(mine(&beacon, &pubsub_addr, &miner))?;
        }
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("config already exists at {}", path.display());
        return Ok(());
    }
    let cfg = NodeConfig::example();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&cfg)?)?;
    println!("wrote config to {}", path.display());
    Ok(())
}

fn run_wallet_cmd(cmd: WalletCmd) -> Result<()> {
    match cmd {
        WalletCmd::New { keys_dir } => {
            let password = prompt_password("password for new key: ")?;
            let keypair = generate_keypair();
            let keystore = Keystore::new(keys_dir.unwrap_or_else(default_keys_dir))?;
            keystore.store(&keypair.address, &keypair.private_key, &password)?;
            println!("created wallet with address {}", keypair.address);
        }
        WalletCmd::List { keys_dir } => {
            let keystore = Keystore::new(keys_dir.unwrap_or_else(default_keys_dir))?;
            for address in keystore.addresses()? {
                println!("{address}");
            }
        }
        WalletCmd::Balance { beacon, address } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(wallet_balance(&beacon, &address))?;
        }
    }
    Ok(())
}

async fn synced_store(beacon: &str) -> Result<InMemoryChainStore> {
    let store = InMemoryChainStore::new();
    let crypto = Secp256k1Provider::new();
    sync::sync_blockchain(&format!("{beacon}/api/blocks"), &store, &crypto)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("syncing chain from beacon")?;
    Ok(store)
}

async fn wallet_balance(beacon: &str, address: &str) -> Result<()> {
    let store = synced_store(beacon).await?;
    let chain = store.blockchain();
    let address = Address::from(address.to_string());
    let balance = kndchain_consensus::balance(&address, &chain, chain.len() as i64 - 1);
    println!("{balance}");
    Ok(())
}

async fn show_chain(beacon: &str) -> Result<()> {
    let store = synced_store(beacon).await?;
    let chain = store.blockchain();
    let dto = ChainDto::from(chain.as_slice());
    println!("{}", serde_json::to_string_pretty(&dto)?);
    Ok(())
}

async fn send(beacon: &str, pubsub_addr: &str, from: &str, to: &str, amount: u64) -> Result<()> {
    let keys_dir = default_keys_dir();
    let keystore = Keystore::new(keys_dir)?;
    let from_address = Address::from(from.to_string());
    let password = prompt_password("wallet password: ")?;
    let private_key = keystore.load(&from_address, &password)?;
    let derived = address_from_private_key(&private_key)?;
    if derived != from_address {
        anyhow::bail!("keystore entry for {from} does not match its own address");
    }

    let crypto = Arc::new(Secp256k1Provider::new());
    let wallet = Wallet::new(private_key, from_address, crypto);
    let store = synced_store(beacon).await?;
    let chain = store.blockchain();
    let to_address = Address::from(to.to_string());
    let tx = create_transaction(&wallet, &chain, &to_address, amount)?;

    let mut peer = PubSubPeer::connect(pubsub_addr)?;
    peer.broadcast_transaction(&tx)?;
    println!("broadcast transaction {}", tx.id);
    Ok(())
}

async fn mine(beacon: &str, pubsub_addr: &str, miner: &str) -> Result<()> {
    let store = synced_store(beacon).await?;
    let pool = TransactionPool::new();
    sync::sync_transaction_pool(&format!("{beacon}/api/transactions"), &pool)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("syncing transaction pool from beacon")?;

    let crypto = Secp256k1Provider::new();
    let miner_address = Address::from(miner.to_string());
    let mut data = pool.valid_transactions(&crypto);
    data.push(reward_transaction(&miner_address));
    let last_block = store.last_block();
    let block = kndchain_consensus::mine_new_block(&last_block, data);
    store.add_block(block.clone())?;

    let chain = store.blockchain();
    let mut peer = PubSubPeer::connect(pubsub_addr)?;
    peer.broadcast_blockchain(&chain)?;
    println!("mined block {}", block.hash);
    Ok(())
}
