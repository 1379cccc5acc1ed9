//! TCP raft transport
//!
//! Every RPC is one request frame followed by one reply frame on a pooled
//! connection. Frames are a 4-byte big-endian length prefix followed by a
//! ciborium-encoded [`RaftRpc`] or [`RaftReply`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::TypeConfig;

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Raft transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer announced a frame above [`MAX_FRAME_SIZE`]
    #[error("Frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    /// Frame could not be encoded
    #[error("Encoding error: {0}")]
    Encode(String),

    /// Frame could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Connect or call exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The remote raft rejected the call
    #[error("Remote error: {0}")]
    Remote(String),

    /// The transport is not serving
    #[error("Transport is closed")]
    Closed,
}

/// Request frame
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpc {
    /// Log replication and heartbeats
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    /// Election
    Vote(VoteRequest<TypeConfig>),
    /// Snapshot chunk
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// Reply frame; remote raft errors travel as text
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftReply {
    /// Reply to [`RaftRpc::AppendEntries`]
    AppendEntries(Result<AppendEntriesResponse<TypeConfig>, String>),
    /// Reply to [`RaftRpc::Vote`]
    Vote(Result<VoteResponse<TypeConfig>, String>),
    /// Reply to [`RaftRpc::InstallSnapshot`]
    InstallSnapshot(Result<InstallSnapshotResponse<TypeConfig>, String>),
}

/// Read one length-prefixed frame
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), TransportError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(data.len()));
    }

    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| TransportError::Encode(e.to_string()))?;
    Ok(buffer)
}

fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Idle outbound connections per peer address
struct ConnectionPool {
    max_idle: usize,
    connect_timeout: Duration,
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
}

impl ConnectionPool {
    fn new(max_idle: usize, connect_timeout: Duration) -> Self {
        Self {
            max_idle,
            connect_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let pooled = self.idle.lock().get_mut(addr).and_then(Vec::pop);
        if let Some(stream) = pooled {
            return Ok(stream);
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;

        debug!("Opened raft connection to {}", addr);
        Ok(stream)
    }

    fn release(&self, addr: &str, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let streams = idle.entry(addr.to_string()).or_default();
        if streams.len() < self.max_idle {
            streams.push(stream);
        }
    }

    #[cfg(test)]
    fn idle_count(&self, addr: &str) -> usize {
        self.idle.lock().get(addr).map_or(0, Vec::len)
    }

    fn clear(&self) {
        self.idle.lock().clear();
    }
}

/// TCP transport for raft RPCs
pub struct RaftTransport {
    local_addr: SocketAddr,
    timeout: Duration,
    pool: Arc<ConnectionPool>,
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RaftTransport {
    /// Bind the listener; RPCs are served once [`RaftTransport::serve`] is called
    pub async fn bind(
        bind_addr: SocketAddr,
        advertise_addr: SocketAddr,
        max_pool: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Raft transport bound to {} (advertising {})",
            local_addr, advertise_addr
        );

        Ok(Self {
            local_addr,
            timeout,
            pool: Arc::new(ConnectionPool::new(max_pool, timeout)),
            listener: Mutex::new(Some(listener)),
            shutdown_tx,
            accept_handle: Mutex::new(None),
        })
    }

    /// Bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Network factory handed to openraft
    pub fn network_factory(&self) -> NetworkFactory {
        NetworkFactory {
            pool: self.pool.clone(),
            timeout: self.timeout,
        }
    }

    /// Start accepting RPCs for `raft`
    pub fn serve(&self, raft: Raft<TypeConfig>) -> Result<(), TransportError> {
        let listener = self.listener.lock().take().ok_or(TransportError::Closed)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let connection_shutdown = self.shutdown_tx.subscribe();
        let local_addr = self.local_addr;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!("Accepted raft connection from {}", peer);
                                let raft = raft.clone();
                                let shutdown_rx = connection_shutdown.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, raft, shutdown_rx).await {
                                        debug!("Raft connection from {} closed: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept raft connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Raft transport on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        *self.accept_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting, close served connections and drop pooled ones
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.accept_handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Raft accept loop ended abnormally: {}", e);
        }

        self.listener.lock().take();
        self.pool.clear();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    raft: Raft<TypeConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame?,
            _ = shutdown_rx.changed() => return Ok(()),
        };

        let rpc: RaftRpc = decode_frame(&frame)?;
        let reply = dispatch(&raft, rpc).await;
        write_frame(&mut stream, &encode_frame(&reply)?).await?;
    }
}

async fn dispatch(raft: &Raft<TypeConfig>, rpc: RaftRpc) -> RaftReply {
    match rpc {
        RaftRpc::AppendEntries(req) => {
            RaftReply::AppendEntries(raft.append_entries(req).await.map_err(|e| e.to_string()))
        }
        RaftRpc::Vote(req) => RaftReply::Vote(raft.vote(req).await.map_err(|e| e.to_string())),
        RaftRpc::InstallSnapshot(req) => RaftReply::InstallSnapshot(
            raft.install_snapshot(req)
                .await
                .map_err(|e| e.to_string()),
        ),
    }
}

/// Creates [`RaftClient`]s sharing the transport's connection pool
pub struct NetworkFactory {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = RaftClient;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        RaftClient {
            target,
            addr: node.addr.clone(),
            pool: self.pool.clone(),
            timeout: self.timeout,
        }
    }
}

/// Raft RPC client for one peer
pub struct RaftClient {
    target: u64,
    addr: String,
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

fn network_error<E: StdError>(e: TransportError) -> RPCError<TypeConfig, E> {
    RPCError::Network(NetworkError::new(&e))
}

fn unexpected(reply: &RaftReply) -> TransportError {
    TransportError::Decode(format!("unexpected reply {reply:?}"))
}

impl RaftClient {
    async fn call(&self, rpc: RaftRpc, ttl: Duration) -> Result<RaftReply, TransportError> {
        let deadline = ttl.min(self.timeout);
        let frame = encode_frame(&rpc)?;
        let mut stream = self.pool.acquire(&self.addr).await?;

        let exchanged = tokio::time::timeout(deadline, async {
            write_frame(&mut stream, &frame).await?;
            read_frame(&mut stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout(deadline))??;

        let reply = decode_frame(&exchanged)?;
        self.pool.release(&self.addr, stream);
        Ok(reply)
    }
}

impl RaftNetwork<TypeConfig> for RaftClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<TypeConfig>, RPCError<TypeConfig, RaftError<TypeConfig>>>
    {
        match self
            .call(RaftRpc::AppendEntries(rpc), option.hard_ttl())
            .await
            .map_err(network_error)?
        {
            RaftReply::AppendEntries(Ok(response)) => Ok(response),
            RaftReply::AppendEntries(Err(remote)) => {
                Err(network_error(TransportError::Remote(remote)))
            }
            other => Err(network_error(unexpected(&other))),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<TypeConfig>,
        RPCError<TypeConfig, RaftError<TypeConfig, InstallSnapshotError>>,
    > {
        match self
            .call(RaftRpc::InstallSnapshot(rpc), option.hard_ttl())
            .await
            .map_err(network_error)?
        {
            RaftReply::InstallSnapshot(Ok(response)) => Ok(response),
            RaftReply::InstallSnapshot(Err(remote)) => {
                Err(network_error(TransportError::Remote(remote)))
            }
            other => Err(network_error(unexpected(&other))),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<VoteResponse<TypeConfig>, RPCError<TypeConfig, RaftError<TypeConfig>>> {
        debug!("Requesting vote from {} at {}", self.target, self.addr);

        match self
            .call(RaftRpc::Vote(rpc), option.hard_ttl())
            .await
            .map_err(network_error)?
        {
            RaftReply::Vote(Ok(response)) => Ok(response),
            RaftReply::Vote(Err(remote)) => Err(network_error(TransportError::Remote(remote))),
            other => Err(network_error(unexpected(&other))),
        }
    }
}
