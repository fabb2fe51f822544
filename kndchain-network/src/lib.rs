//! Wire DTOs, the HTTP sync client, and the gossipsub pub/sub peer.

pub mod wire {
    use kndchain_core::{Block, Transaction};
    use serde::{Deserialize, Serialize};

    /// On-wire block JSON: `{timestamp, lastHash, hash, data, nonce, difficulty}`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BlockDto {
        pub timestamp: u64,
        pub last_hash: String,
        pub hash: String,
        pub data: Vec<Transaction>,
        pub nonce: u64,
        pub difficulty: u64,
    }

    impl From<&Block> for BlockDto {
        fn from(b: &Block) -> Self {
            BlockDto {
                timestamp: b.timestamp,
                last_hash: b.last_hash.clone(),
                hash: b.hash.clone(),
                data: b.data.clone(),
                nonce: b.nonce,
                difficulty: b.difficulty,
            }
        }
    }

    impl From<BlockDto> for Block {
        fn from(d: BlockDto) -> Self {
            Block {
                timestamp: d.timestamp,
                last_hash: d.last_hash,
                hash: d.hash,
                data: d.data,
                nonce: d.nonce,
                difficulty: d.difficulty,
            }
        }
    }

    /// Transactions already serialize to the wire shape directly from the
    /// core type (`id`, `input.sig`, map-valued `output`), so no separate
    /// DTO is needed for them.
    pub type TransactionDto = Transaction;

    /// On-wire chain JSON: `{chain: Block[]}`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChainDto {
        pub chain: Vec<BlockDto>,
    }

    impl From<&[Block]> for ChainDto {
        fn from(chain: &[Block]) -> Self {
            ChainDto {
                chain: chain.iter().map(BlockDto::from).collect(),
            }
        }
    }

    impl From<ChainDto> for Vec<Block> {
        fn from(dto: ChainDto) -> Self {
            dto.chain.into_iter().map(Block::from).collect()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PoolDto {
        pub transactions: Vec<Transaction>,
    }
}

pub mod sync {
    use super::wire::{ChainDto, PoolDto};
    use kndchain_core::{Block, ChainStore, CryptoProvider, SyncError, Transaction, TransactionId};
    use kndchain_wallet::TransactionPool;
    use std::time::Duration;
    use tracing::warn;

    /// HTTP GET `url`, decode a chain, and feed it through
    /// `kndchain_consensus::replace_chain`. Failures are returned, never
    /// fatal.
    pub async fn sync_blockchain(
        url: &str,
        store: &dyn ChainStore,
        crypto: &dyn CryptoProvider,
    ) -> Result<(), SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| SyncError::Unreachable)?;
        let dto: ChainDto = client
            .get(url)
            .send()
            .await
            .map_err(|_| SyncError::Unreachable)?
            .json()
            .await
            .map_err(|_| SyncError::InvalidResponse)?;
        let chain: Vec<Block> = dto.into();
        kndchain_consensus::replace_chain(store, chain, crypto)
            .map_err(|_| SyncError::InvalidResponse)
    }

    pub async fn sync_transaction_pool(url: &str, pool: &TransactionPool) -> Result<(), SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| SyncError::Unreachable)?;
        let dto: PoolDto = client
            .get(url)
            .send()
            .await
            .map_err(|_| SyncError::Unreachable)?
            .json()
            .await
            .map_err(|_| SyncError::InvalidResponse)?;
        let snapshot: std::collections::HashMap<TransactionId, Transaction> =
            dto.transactions.into_iter().map(|t| (t.id, t)).collect();
        pool.replace(snapshot);
        Ok(())
    }

    pub fn log_sync_failure(context: &str, err: &SyncError) {
        warn!(%context, %err, "sync attempt failed, continuing without it");
    }
}

pub mod pubsub {
    use super::wire::ChainDto;
    use futures::prelude::*;
    use kndchain_core::{Block, ChainStore, CryptoProvider, Transaction};
    use kndchain_wallet::TransactionPool;
    use libp2p::gossipsub::{self, IdentTopic as Topic, MessageAuthenticity, ValidationMode};
    use libp2p::identity::Keypair;
    use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmBuilder, SwarmEvent};
    use libp2p::{identify, mdns, noise, tcp, yamux, Multiaddr, PeerId, Transport};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    /// Channel names by convention: `kndchain` for blocks,
    /// `kndchaintransactions` for pending transactions.
    pub const BLOCKS_TOPIC: &str = "kndchain";
    pub const TRANSACTIONS_TOPIC: &str = "kndchaintransactions";

    #[derive(NetworkBehaviour)]
    struct KndchainBehaviour {
        gossipsub: gossipsub::Behaviour,
        identify: identify::Behaviour,
        mdns: mdns::tokio::Behaviour,
    }

    fn build_swarm(listen_addr: &str) -> anyhow::Result<(Swarm<KndchainBehaviour>, Topic, Topic)> {
        let local_key = Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(libp2p::core::upgrade::Version::V1)
            .authenticate(noise::Config::new(&local_key)?)
            .multiplex(yamux::Config::default())
            .boxed();

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .validation_mode(ValidationMode::Permissive)
            .build()
            .expect("static gossipsub config is always valid");

        let gossipsub =
            gossipsub::Behaviour::new(MessageAuthenticity::Signed(local_key.clone()), gossipsub_config)
                .map_err(|e| anyhow::anyhow!(e))?;

        let identify = identify::Behaviour::new(identify::Config::new(
            "/kndchain/0.1".into(),
            local_key.public(),
        ));
        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

        let behaviour = KndchainBehaviour {
            gossipsub,
            identify,
            mdns,
        };
        let mut swarm = SwarmBuilder::with_tokio_executor(transport, behaviour, local_peer_id).build();
        let addr: Multiaddr = listen_addr.parse()?;
        swarm.listen_on(addr)?;

        let block_topic = Topic::new(BLOCKS_TOPIC);
        let tx_topic = Topic::new(TRANSACTIONS_TOPIC);
        Ok((swarm, block_topic, tx_topic))
    }

    /// Gossipsub-backed implementation of the two-channel pub/sub peer.
    /// `connect`/`subscribe_peers` stand up the swarm and its receive
    /// task; `disconnect` tears the task down.
    pub struct PubSubPeer {
        swarm: Option<Swarm<KndchainBehaviour>>,
        block_topic: Topic,
        tx_topic: Topic,
        receive_task: Option<JoinHandle<()>>,
    }

    impl PubSubPeer {
        pub fn connect(listen_addr: &str) -> anyhow::Result<Self> {
            let (swarm, block_topic, tx_topic) = build_swarm(listen_addr)?;
            Ok(Self {
                swarm: Some(swarm),
                block_topic,
                tx_topic,
                receive_task: None,
            })
        }

        pub fn disconnect(&mut self) {
            if let Some(handle) = self.receive_task.take() {
                handle.abort();
            }
            self.swarm = None;
        }

        /// Subscribes to both channels and spawns the receive task.
        ///
        /// `mining_cancel`, if given, is set whenever an incoming chain is
        /// accepted, so a mining round in progress against the old head
        /// can abandon its search immediately.
        pub fn subscribe_peers(
            &mut self,
            store: Arc<dyn ChainStore>,
            pool: Arc<TransactionPool>,
            crypto: Arc<dyn CryptoProvider>,
            mining_cancel: Option<Arc<AtomicBool>>,
        ) -> anyhow::Result<()> {
            let mut swarm = self
                .swarm
                .take()
                .ok_or_else(|| anyhow::anyhow!("peer is not connected"))?;
            swarm.behaviour_mut().gossipsub.subscribe(&self.block_topic)?;
            swarm.behaviour_mut().gossipsub.subscribe(&self.tx_topic)?;

            let block_topic_hash = self.block_topic.hash();
            let tx_topic_hash = self.tx_topic.hash();

            self.receive_task = Some(tokio::spawn(async move {
                loop {
                    match swarm.select_next_some().await {
                        SwarmEvent::Behaviour(KndchainBehaviourEvent::Gossipsub(
                            gossipsub::Event::Message { message, .. },
                        )) => {
                            if message.topic == block_topic_hash {
                                handle_block_message(
                                    &message.data,
                                    &store,
                                    &pool,
                                    &crypto,
                                    mining_cancel.as_ref(),
                                );
                            } else if message.topic == tx_topic_hash {
                                handle_transaction_message(&message.data, &pool);
                            }
                        }
                        SwarmEvent::Behaviour(KndchainBehaviourEvent::Mdns(mdns::Event::Discovered(
                            list,
                        ))) => {
                            for (peer, addr) in list {
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                                debug!(%peer, %addr, "discovered peer via mdns");
                            }
                        }
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(%address, "pub/sub peer listening");
                        }
                        _ => {}
                    }
                }
            }));
            Ok(())
        }

        pub fn broadcast_blockchain(&mut self, chain: &[Block]) -> anyhow::Result<()> {
            let swarm = self
                .swarm
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("peer is not connected"))?;
            let dto = ChainDto::from(chain);
            let data = serde_json::to_vec(&dto)?;
            swarm
                .behaviour_mut()
                .gossipsub
                .publish(self.block_topic.clone(), data)?;
            Ok(())
        }

        pub fn broadcast_transaction(&mut self, tx: &Transaction) -> anyhow::Result<()> {
            let swarm = self
                .swarm
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("peer is not connected"))?;
            let data = serde_json::to_vec(tx)?;
            swarm
                .behaviour_mut()
                .gossipsub
                .publish(self.tx_topic.clone(), data)?;
            Ok(())
        }
    }

    fn handle_block_message(
        data: &[u8],
        store: &Arc<dyn ChainStore>,
        pool: &Arc<TransactionPool>,
        crypto: &Arc<dyn CryptoProvider>,
        mining_cancel: Option<&Arc<AtomicBool>>,
    ) {
        let dto: ChainDto = match serde_json::from_slice(data) {
            Ok(dto) => dto,
            Err(e) => {
                warn!(error = %e, "dropping undecodable blocks message");
                return;
            }
        };
        let chain: Vec<Block> = dto.into();
        match kndchain_consensus::replace_chain(store.as_ref(), chain, crypto.as_ref()) {
            Ok(()) => {
                pool.drain_committed(&store.blockchain());
                if let Some(flag) = mining_cancel {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            Err(e) => warn!(error = %e, "dropping invalid candidate chain"),
        }
    }

    fn handle_transaction_message(data: &[u8], pool: &Arc<TransactionPool>) {
        match serde_json::from_slice::<Transaction>(data) {
            Ok(tx) => {
                let _ = pool.add(tx);
            }
            Err(e) => warn!(error = %e, "dropping undecodable transaction message"),
        }
    }
}
