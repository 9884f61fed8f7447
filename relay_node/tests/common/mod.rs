//! Shared fixture: a devnet chain with five staked servicers, one staked
//! requestor and an in-process HTTP backing chain.

#![allow(dead_code)]

use axum::{routing::post, Router};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use relay_node::chains::{HostedBlockchain, HostedChains};
use relay_node::config::NodeConfig;
use relay_node::crypto::{PrivateKey, Signature};
use relay_node::onchain::{GenesisDoc, LocalChain};
use relay_node::protocol::{ChainIo, ProtocolHandler, TxCodec};
use relay_node::registry::RegistryView;
use relay_node::storage::MemoryStorage;
use relay_node::types::{Aat, Payload, Relay, RelayMeta, RelayProof, RequestorInfo, ServicerInfo};
use relay_node::Engine;

pub const CHAIN: &str = "0001";
pub const ZONE: &str = "0001";
pub const UPSTREAM_BODY: &str = r#"{"jsonrpc":"2.0","id":1,"result":"0x10d4f"}"#;
pub const SERVICER_BALANCE: u64 = 1_000_000;

/// Backing chain answering every POST with `UPSTREAM_BODY`.
pub struct Upstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub async fn spawn() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    UPSTREAM_BODY
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, hits }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub struct Devnet {
    pub requestor: PrivateKey,
    /// Staked and hosted, in stake order
    pub servicers: Vec<PrivateKey>,
    /// Hosted by the node but never staked
    pub outsider: PrivateKey,
    pub chain: Arc<LocalChain>,
    pub engine: Arc<Engine>,
    pub upstream: Upstream,
}

impl Devnet {
    pub async fn start() -> Self {
        Self::start_with(NodeConfig::default(), |_| {}).await
    }

    pub async fn start_with(config: NodeConfig, tune: impl FnOnce(&mut GenesisDoc)) -> Self {
        let requestor = PrivateKey::from_seed([1u8; 32]);
        let servicers: Vec<PrivateKey> = (0..5).map(|i| PrivateKey::from_seed([10 + i; 32])).collect();
        let outsider = PrivateKey::from_seed([99u8; 32]);

        let mut genesis = GenesisDoc::default();
        genesis.params.supported_blockchains = vec![CHAIN.into()];
        genesis.params.supported_geo_zones = vec![ZONE.into()];
        for (i, key) in servicers.iter().enumerate() {
            genesis.servicers.push(ServicerInfo {
                address: key.address(),
                public_key: key.public_key(),
                service_url: format!("http://servicer-{}.local", i),
                chains: vec![CHAIN.into()],
                geo_zones: vec![ZONE.into()],
                staked_tokens: 10_000,
                jailed: false,
            });
            genesis.balances.insert(key.address(), SERVICER_BALANCE);
        }
        genesis.requestors.push(RequestorInfo {
            address: requestor.address(),
            public_key: requestor.public_key(),
            chains: vec![CHAIN.into()],
            staked_tokens: 1_000,
            max_relays: 0,
            jailed: false,
        });
        tune(&mut genesis);

        let chain = Arc::new(LocalChain::new(
            genesis.into_state(),
            TxCodec::new(config.codec_upgrade_height),
            config.network_id.clone(),
        ));
        // session 1 starts at block 1
        chain.commit_block().unwrap();

        let upstream = Upstream::spawn().await;
        let hosted = HostedChains::new(vec![HostedBlockchain {
            id: CHAIN.into(),
            http_url: format!("http://{}", upstream.addr),
            websocket_url: None,
            basic_auth: None,
        }])
        .unwrap();

        let mut keys = servicers.clone();
        keys.push(outsider.clone());
        let engine = Arc::new(
            Engine::new(
                config,
                chain.clone() as Arc<dyn RegistryView>,
                Arc::new(hosted),
                None,
                keys,
                Arc::new(MemoryStorage::new()),
            )
            .unwrap(),
        );

        Self {
            requestor,
            servicers,
            outsider,
            chain,
            engine,
            upstream,
        }
    }

    pub fn handler(&self) -> ProtocolHandler {
        ProtocolHandler::new(self.engine.clone(), self.chain.clone() as Arc<dyn ChainIo>).unwrap()
    }

    pub fn height(&self) -> i64 {
        self.chain.latest_height()
    }

    /// Relay for the current session, signed by the requestor acting as
    /// its own client.
    pub fn relay(&self, servicer: &PrivateKey, entropy: i64) -> Relay {
        let payload = Payload {
            data: r#"{"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}"#.into(),
            method: "POST".into(),
            path: String::new(),
            headers: BTreeMap::new(),
        };
        let meta = RelayMeta {
            block_height: self.height(),
        };
        let aat = Aat::new_signed(&self.requestor, self.requestor.public_key()).unwrap();
        let params = self.chain.get_params(self.height()).unwrap();
        let mut proof = RelayProof {
            request_hash: Relay::compute_request_hash(&payload, &meta).unwrap(),
            entropy,
            session_block_height: params.session_start(self.height()),
            servicer_pub_key: servicer.public_key(),
            blockchain: CHAIN.into(),
            geo_zone: ZONE.into(),
            num_servicers: 5,
            aat,
            signature: Signature([0u8; 64]),
        };
        proof.sign(&self.requestor).unwrap();
        Relay { payload, meta, proof }
    }

    /// Commits blocks up to `height`, driving `handler` after each one.
    pub async fn advance_to(&self, handler: &ProtocolHandler, height: i64) {
        while self.height() < height {
            let committed = self.chain.commit_block().unwrap();
            handler.process_block(committed).await.unwrap();
        }
    }
}
