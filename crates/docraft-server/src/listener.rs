//! Leader connection listener
//!
//! Accepts on tokio, then hands each connection to a blocking follower
//! session: admission runs on the blocking pool, the session worker on its
//! own thread.

use crate::config::Config;
use docraft_core::consensus::{ConsensusEngine, DocumentsStateMachine, Follower, RemoteConnection};
use docraft_core::documents::DocumentsStorage;
use docraft_core::storage::StorageEnvironment;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Storage, documents and consensus engine of one node
pub struct Node {
    /// Storage environment
    pub storage: Arc<StorageEnvironment>,
    /// Document store
    pub documents: Arc<DocumentsStorage>,
    /// Consensus engine
    pub engine: Arc<ConsensusEngine>,
}

impl Node {
    /// Open the node described by `config`
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let storage = Arc::new(StorageEnvironment::open(&config.storage())?);
        let documents = Arc::new(DocumentsStorage::open(Arc::clone(&storage))?);
        let state_machine = Arc::new(DocumentsStateMachine::new(Arc::clone(&documents)));
        let engine = ConsensusEngine::open(config.consensus(), Arc::clone(&storage), state_machine)?;

        tracing::info!(
            "Opened node {} with data directory {:?}",
            engine.url(),
            config.data_dir
        );
        Ok(Self {
            storage,
            documents,
            engine,
        })
    }

    /// End the active session and flush storage
    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.engine.shutdown();
        self.storage.sync()?;
        Ok(())
    }
}

/// Accept leader connections until `shutdown` completes
pub async fn serve<S>(listener: TcpListener, engine: Arc<ConsensusEngine>, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    tracing::info!("Listening for leaders on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = hand_off(stream, peer, Arc::clone(&engine)) {
                            tracing::warn!("Failed to set up connection from {}: {}", peer, e);
                        }
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                }
            }
        }
    }
}

fn hand_off(stream: TcpStream, peer: SocketAddr, engine: Arc<ConsensusEngine>) -> anyhow::Result<()> {
    let stream = stream.into_std()?;
    // Sessions use blocking reads
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let connection = RemoteConnection::new(stream)?;
    let follower = Follower::new(engine, connection);
    tracing::debug!("Connection from {} as session {}", peer, follower.id());

    tokio::task::spawn_blocking(move || match follower.try_accept_connection() {
        Ok(true) => {}
        Ok(false) => tracing::debug!("Rejected leader {}", peer),
        Err(e) if e.is_benign_termination() => {
            tracing::debug!("Connection from {} closed during admission: {}", peer, e)
        }
        Err(e) => tracing::warn!("Admission of {} failed: {}", peer, e),
    });
    Ok(())
}
