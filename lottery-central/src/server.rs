use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::{bail, Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    bet::{AgencyId, BetBatch},
    central::Central,
    protocol::{read_request, write_response, Request, Response},
};

type ConnectionId = u64;

/// Binds the listening socket with an explicit accept backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener, central: Arc<Central>, max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            state: Arc::new(ServerState {
                central,
                registry: Arc::new(ConnectionRegistry::new(max_connections)),
                shutdown,
            }),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed and every live handler is told to
    /// drop its connection. Handlers are not awaited.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state).await;
                }
            }
        }

        drop(listener);
        info!("listening socket closed");
        Ok(())
    }

    pub async fn run_until_terminated(self) -> Result<()> {
        self.run_until(termination_signal()).await
    }
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            warn!(error = ?err, "failed to listen for ctrl-c");
                        }
                        info!("received ctrl-c");
                    }
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(err) => warn!(error = ?err, "failed to install SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}

struct ServerState {
    central: Arc<Central>,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Sender<bool>,
}

fn handle_shutdown(state: &ServerState) {
    info!(
        live = state.registry.live(),
        "central shutting down, closing client connections"
    );
    state.shutdown.send_replace(true);
}

async fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &ServerState) {
    match result {
        Ok((stream, peer)) => match state.registry.try_admit(peer) {
            Some(slot) => spawn_connection_handler(stream, slot, state),
            None => reject_connection(stream, peer, state.registry.capacity()).await,
        },
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn reject_connection(mut stream: TcpStream, peer: SocketAddr, capacity: usize) {
    info!(%peer, capacity, "max clients connected, rejecting connection");
    if let Err(err) = write_response(&mut stream, &Response::Rejected).await {
        debug!(%peer, error = ?err, "failed to send rejection");
    }
    if let Err(err) = stream.shutdown().await {
        debug!(%peer, error = ?err, "failed to close rejected connection");
    }
}

fn spawn_connection_handler(stream: TcpStream, slot: ConnectionSlot, state: &ServerState) {
    let central = Arc::clone(&state.central);
    let shutdown = state.shutdown.subscribe();
    tokio::spawn(async move {
        let peer = slot.peer();
        info!(%peer, connection = slot.id(), "connection admitted");
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(central, peer);
        if let Err(err) = handler.run(BufReader::new(reader), writer, shutdown).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
        drop(slot);
    });
}

/// Bounds the number of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    capacity: usize,
    live: Mutex<HashMap<ConnectionId, SocketAddr>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            live: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, SocketAddr>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `peer` unless the registry is full. The slot is released when
    /// the returned guard is dropped.
    pub fn try_admit(self: &Arc<Self>, peer: SocketAddr) -> Option<ConnectionSlot> {
        let mut live = self.connections();
        if live.len() >= self.capacity {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        live.insert(id, peer);
        Some(ConnectionSlot {
            id,
            peer,
            registry: Arc::clone(self),
        })
    }

    pub fn live(&self) -> usize {
        self.connections().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self, id: ConnectionId) {
        self.connections().remove(&id);
    }
}

/// A live connection's place in the [`ConnectionRegistry`].
#[derive(Debug)]
pub struct ConnectionSlot {
    id: ConnectionId,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Open,
    Closed,
}

/// Drives one agency connection from its first frame until it closes.
pub struct ConnectionHandler {
    central: Arc<Central>,
    peer: SocketAddr,
    agency: Option<AgencyId>,
}

impl ConnectionHandler {
    pub fn new(central: Arc<Central>, peer: SocketAddr) -> Self {
        Self {
            central,
            peer,
            agency: None,
        }
    }

    /// Serves requests until the peer closes, a one-shot query is answered,
    /// an error occurs, or `shutdown` fires.
    pub async fn run<R, W>(
        mut self,
        mut reader: R,
        mut writer: W,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut state = HandlerState::Open;
        while state == HandlerState::Open {
            let request = select! {
                _ = shutdown.changed() => {
                    debug!(peer = %self.peer, "dropping connection for shutdown");
                    return Ok(());
                }
                request = read_request(&mut reader) => request,
            };

            state = match request.context("failed to read request")? {
                Some(request) => self.handle_request(request, &mut writer).await?,
                None => {
                    debug!(peer = %self.peer, "peer closed the connection");
                    HandlerState::Closed
                }
            };
        }
        Ok(())
    }

    async fn handle_request<W>(&mut self, request: Request, writer: &mut W) -> Result<HandlerState>
    where
        W: AsyncWrite + Unpin,
    {
        match request {
            Request::Bets(batch) => {
                self.store_bets(batch, writer).await?;
                Ok(HandlerState::Open)
            }
            Request::DeliveryEnded { agency } => {
                self.bind_agency(agency)?;
                match self.central.mark_finished(agency) {
                    Ok(ready) => debug!(peer = %self.peer, agency, ready, "delivery ended"),
                    Err(err) => warn!(peer = %self.peer, error = %err, "ignoring delivery-ended"),
                }
                Ok(HandlerState::Open)
            }
            Request::AskWinners { agency } => {
                self.bind_agency(agency)?;
                let response = match self.central.winners(agency) {
                    Some(count) => {
                        info!(peer = %self.peer, agency, winners = count, "winners reported");
                        Response::Winners(count)
                    }
                    None => {
                        debug!(peer = %self.peer, agency, "draw still pending");
                        Response::Pending
                    }
                };
                write_response(writer, &response)
                    .await
                    .context("failed to send winners")?;
                Ok(HandlerState::Closed)
            }
        }
    }

    async fn store_bets<W>(&mut self, mut batch: BetBatch, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(agency) = self.agency.or_else(|| batch.bets.first().map(|bet| bet.agency)) {
            self.agency = Some(agency);
            batch.retain_agency(agency);
        }

        for rejected in &batch.rejected {
            warn!(
                peer = %self.peer,
                line = %rejected.line,
                reason = %rejected.reason,
                "dropping malformed bet"
            );
        }

        let total = self
            .central
            .record_bets(&batch.bets)
            .context("failed to store bets")?;
        info!(
            peer = %self.peer,
            agency = ?self.agency,
            stored = batch.len(),
            rejected = batch.rejected.len(),
            total,
            "bets stored"
        );

        write_response(writer, &Response::Ack(batch.numbers()))
            .await
            .context("failed to acknowledge bets")?;
        Ok(())
    }

    fn bind_agency(&mut self, agency: AgencyId) -> Result<()> {
        match self.agency {
            None => {
                self.agency = Some(agency);
                Ok(())
            }
            Some(bound) if bound == agency => Ok(()),
            Some(bound) => bail!("connection bound to agency {bound} spoke for agency {agency}"),
        }
    }
}
