//! Constellation node binary
//!
//! Runs a single node with a logging transport and a local ledger that
//! accepts the vault setup but never closes new ledgers. Network transports
//! and ledger clients plug in through `quantum_core::ports`.

use anyhow::Context;
use async_trait::async_trait;
use quantum_core::constellation::ConstellationInitRequest;
use quantum_core::messages::{Envelope, LedgerUpdateNotification};
use quantum_core::node::{Node, NodeServices};
use quantum_core::ports::{
    LedgerInfo, LedgerOracle, LedgerUpdateStream, Persistence, SignedVaultTransaction, Transport,
};
use quantum_core::types::PublicKey;
use quantum_core::{Config, Role};
use std::future::IntoFuture;
use std::sync::Arc;

#[derive(Debug)]
struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn broadcast_quantum(&self, quantum: &Envelope) -> quantum_core::Result<()> {
        let apex = quantum.message.as_quantum().map(|q| q.apex);
        tracing::debug!(?apex, "Broadcast quantum");
        Ok(())
    }

    async fn send_to_alpha(&self, _message: &Envelope) -> quantum_core::Result<()> {
        tracing::debug!("Message to alpha");
        Ok(())
    }

    async fn request_quanta(&self, from: u64, to: u64) -> quantum_core::Result<()> {
        tracing::debug!(from, to, "Quanta requested");
        Ok(())
    }

    async fn notify_client(&self, account: &PublicKey, _result: &Envelope) -> quantum_core::Result<()> {
        tracing::debug!(account = %account, "Client notified");
        Ok(())
    }
}

#[derive(Debug)]
struct LocalLedger;

#[async_trait]
impl LedgerOracle for LocalLedger {
    async fn latest_ledger(&self) -> quantum_core::Result<u64> {
        Ok(1)
    }

    async fn get_ledger(&self, sequence: u64) -> quantum_core::Result<Option<LedgerInfo>> {
        Ok((sequence <= 1).then(|| LedgerInfo {
            sequence,
            close_time: chrono::Utc::now().timestamp(),
        }))
    }

    async fn subscribe(&self, _from: u64) -> quantum_core::Result<LedgerUpdateStream> {
        Ok(Box::pin(tokio_stream::pending::<
            quantum_core::Result<LedgerUpdateNotification>,
        >()))
    }

    async fn submit_transaction(
        &self,
        transaction: SignedVaultTransaction,
    ) -> quantum_core::Result<bool> {
        tracing::info!(
            signers = transaction.signers.len(),
            threshold = transaction.threshold,
            "Vault transaction accepted locally"
        );
        Ok(true)
    }
}

fn open_persistence(config: &Config) -> anyhow::Result<Arc<dyn Persistence>> {
    #[cfg(feature = "rocksdb")]
    {
        let storage = quantum_core::storage::RocksDbPersistence::open(&config.storage)
            .context("Failed to open RocksDB")?;
        Ok(Arc::new(storage))
    }
    #[cfg(not(feature = "rocksdb"))]
    {
        tracing::warn!(
            data_dir = ?config.storage.data_dir,
            "Built without rocksdb, state is kept in memory"
        );
        Ok(Arc::new(quantum_core::storage::MemoryPersistence::new()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("QUANTUM_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("Failed to load {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };
    tracing::info!(role = %config.node.role, "Starting quantum node");

    let services = NodeServices {
        persistence: open_persistence(&config)?,
        transport: Arc::new(LogTransport),
        oracle: Arc::new(LocalLedger),
    };
    let node = Node::start(&config, services).await?;

    let listener = tokio::net::TcpListener::bind(&config.metrics_listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.metrics_listen_addr))?;
    tracing::info!(addr = %config.metrics_listen_addr, "Serving GET /metrics");
    let (stop_metrics, stopped) = tokio::sync::oneshot::channel::<()>();
    let exporter = tokio::spawn(
        axum::serve(listener, quantum_core::metrics::router(node.metrics().clone()))
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .into_future(),
    );

    if config.node.role == Role::Leader {
        if let Ok(path) = std::env::var("QUANTUM_INIT_FILE") {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path))?;
            let request: ConstellationInitRequest =
                toml::from_str(&content).context("Invalid constellation parameters")?;
            let genesis = node.initialize(request).await?;
            tracing::info!(apex = genesis.apex, "Genesis snapshot created");
        }
    }

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down quantum node");
    node.shutdown().await?;
    let _ = stop_metrics.send(());
    exporter.await?.context("Metrics exporter failed")?;
    Ok(())
}
