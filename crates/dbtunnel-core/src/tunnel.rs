//! Local-to-pod tunnels.
//!
//! A [`Tunnel`] is owned by whoever opened it and is closed exactly once:
//! explicitly through [`Tunnel::close`], or by `Drop` if an early return or
//! panic skips the explicit close. The production [`KubePortForwarder`]
//! listens on an ephemeral `127.0.0.1` port and bridges each accepted
//! connection to a fresh port-forward stream into the pod.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Portforwarder};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Upper bound on waiting for the accept loop to wind down on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The pod port a tunnel forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelTarget {
    pub namespace: String,
    pub pod: String,
    pub remote_port: u16,
}

impl TunnelTarget {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>, remote_port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            remote_port,
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.remote_port)
    }
}

/// Lifecycle of an opened tunnel.
///
/// There is no observable pending state: `open` only returns once the
/// forward is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Open,
    Closed,
}

/// An open forward from a local port to a pod port.
pub struct Tunnel {
    target: TunnelTarget,
    local_port: u16,
    state: TunnelState,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Wrap an already-running forward. Cancelling `shutdown` must stop it;
    /// `task`, if any, is awaited on close.
    pub fn new(
        target: TunnelTarget,
        local_port: u16,
        shutdown: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            target,
            local_port,
            state: TunnelState::Open,
            shutdown,
            task,
        }
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TunnelState::Open
    }

    /// Stop forwarding and release the local port.
    ///
    /// Idempotent: only the first call has any effect. Teardown problems are
    /// logged, never returned, so they cannot mask the caller's own error.
    pub async fn close(&mut self) {
        if self.state == TunnelState::Closed {
            return;
        }
        self.state = TunnelState::Closed;
        self.shutdown.cancel();

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(tunnel = %self.target, error = %e, "Tunnel task failed"),
                Err(_) => warn!(
                    tunnel = %self.target,
                    "Tunnel did not shut down within {:?}",
                    CLOSE_TIMEOUT
                ),
            }
        }

        info!(
            tunnel = %self.target,
            local_port = self.local_port,
            "Tunnel closed"
        );
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.state == TunnelState::Open {
            warn!(tunnel = %self.target, "Tunnel dropped while open, closing");
            self.state = TunnelState::Closed;
            self.shutdown.cancel();
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("local_port", &self.local_port)
            .field("state", &self.state)
            .finish()
    }
}

/// Opens tunnels into the cluster.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Blocks until the forward is ready, or fails.
    async fn open(&self, target: &TunnelTarget) -> Result<Tunnel>;
}

trait PodIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PodIo for T {}

/// One stream into the pod, plus the port-forward session carrying it.
struct PodStream {
    io: Box<dyn PodIo>,
    forwarder: Option<Portforwarder>,
}

impl PodStream {
    fn new(io: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) -> Self {
        Self {
            io: Box::new(io),
            forwarder: None,
        }
    }

    /// Tear down the carrying port-forward session, if any.
    fn release(forwarder: Option<Portforwarder>) {
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
    }
}

/// Opens a fresh stream to the target for each bridged connection.
#[async_trait]
trait StreamSource: Send + Sync + 'static {
    async fn connect(&self, target: &TunnelTarget) -> Result<PodStream>;
}

/// [`StreamSource`] over the pod port-forward subresource.
struct KubeStreams {
    pods: Api<Pod>,
}

#[async_trait]
impl StreamSource for KubeStreams {
    async fn connect(&self, target: &TunnelTarget) -> Result<PodStream> {
        let mut forwarder = self
            .pods
            .portforward(&target.pod, &[target.remote_port])
            .await
            .map_err(|e| Error::tunnel(&target.pod, target.remote_port, e.to_string()))?;

        let io = forwarder.take_stream(target.remote_port).ok_or_else(|| {
            Error::tunnel(
                &target.pod,
                target.remote_port,
                "port-forward returned no stream",
            )
        })?;

        let mut stream = PodStream::new(io);
        stream.forwarder = Some(forwarder);
        Ok(stream)
    }
}

/// [`PortForwarder`] using the API server's pod port-forward subresource.
#[derive(Clone)]
pub struct KubePortForwarder {
    client: Client,
}

impl KubePortForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PortForwarder for KubePortForwarder {
    async fn open(&self, target: &TunnelTarget) -> Result<Tunnel> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        if pods.get_opt(&target.pod).await?.is_none() {
            return Err(Error::PodNotFound {
                namespace: target.namespace.clone(),
                name: target.pod.clone(),
            });
        }

        serve(KubeStreams { pods }, target).await
    }
}

/// Establish the first stream, then listen locally and bridge connections.
///
/// The first stream doubles as the readiness check and serves the first
/// local connection.
async fn serve<S: StreamSource>(source: S, target: &TunnelTarget) -> Result<Tunnel> {
    let warm = source.connect(target).await?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(|e| Error::tunnel(&target.pod, target.remote_port, e.to_string()))?;
    let local_port = listener
        .local_addr()
        .map_err(|e| Error::tunnel(&target.pod, target.remote_port, e.to_string()))?
        .port();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(accept_loop(
        source,
        target.clone(),
        listener,
        warm,
        shutdown.clone(),
    ));

    info!(tunnel = %target, local_port, "Tunnel open");
    Ok(Tunnel::new(target.clone(), local_port, shutdown, Some(task)))
}

async fn accept_loop<S: StreamSource>(
    source: S,
    target: TunnelTarget,
    listener: TcpListener,
    warm: PodStream,
    shutdown: CancellationToken,
) {
    let mut warm = Some(warm);

    loop {
        let (conn, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(tunnel = %target, error = %e, "Accept failed");
                    continue;
                }
            },
        };
        debug!(tunnel = %target, %peer, "Local connection accepted");

        let upstream = match warm.take() {
            Some(stream) => stream,
            None => match source.connect(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(tunnel = %target, error = %e, "Could not open pod stream");
                    continue;
                }
            },
        };

        tokio::spawn(bridge(conn, upstream, target.clone(), shutdown.child_token()));
    }

    if let Some(unused) = warm {
        PodStream::release(unused.forwarder);
    }
    debug!(tunnel = %target, "Accept loop stopped");
}

async fn bridge(
    mut conn: TcpStream,
    upstream: PodStream,
    target: TunnelTarget,
    shutdown: CancellationToken,
) {
    let PodStream { mut io, forwarder } = upstream;

    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!(tunnel = %target, "Connection cut by tunnel close");
        }
        copied = tokio::io::copy_bidirectional(&mut conn, &mut io) => match copied {
            Ok((to_pod, from_pod)) => debug!(tunnel = %target, to_pod, from_pod, "Connection finished"),
            Err(e) => debug!(tunnel = %target, error = %e, "Connection error"),
        },
    }

    drop(io);
    PodStream::release(forwarder);
}
