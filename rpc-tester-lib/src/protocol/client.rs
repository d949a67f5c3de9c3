use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
};

use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tokio::{
    io::AsyncWriteExt as _,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::{
    CallError, RpcVerb,
    frame::{RequestFrame, ResponseFrame, write_frame},
};

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub nodelay: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

type ReplySender = oneshot::Sender<Result<Vec<u8>, CallError>>;

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, ReplySender>,
    closed: bool,
}

impl Pending {
    fn close(&mut self) {
        self.closed = true;
        for (_, reply) in self.calls.drain() {
            let _ = reply.send(Err(CallError::ConnectionClosed));
        }
    }
}

/// Multiplexing rpc client bound to a single connection.
///
/// Any number of calls can be outstanding at once, they are written by a
/// single writer task in issue order and matched to replies by id. The
/// client is meant to be shared by reference between all call loops of a
/// shard; it is not `Send`.
pub struct Client {
    peer: SocketAddr,
    next_id: Cell<u64>,
    pending: Rc<RefCell<Pending>>,
    outbound: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: RefCell<Option<JoinHandle<()>>>,
    writer: RefCell<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.peer)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Client {
    /// Connect to a peer; must be called from within a `LocalSet`.
    pub async fn connect(peer: SocketAddr, opts: ClientOptions) -> Result<Self, BoxError> {
        let stream = TcpStream::connect(peer)
            .await
            .context("connect rpc client")
            .context_field("peer", peer)?;
        stream
            .set_nodelay(opts.nodelay)
            .context("set TCP_NODELAY on rpc client socket")?;

        tracing::debug!(server.address = %peer, nodelay = opts.nodelay, "rpc client connected");

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending = Rc::new(RefCell::new(Pending::default()));

        let writer = tokio::task::spawn_local(write_loop(write_half, outbound_rx, pending.clone()));
        let reader = tokio::task::spawn_local(read_loop(read_half, pending.clone(), peer));

        Ok(Self {
            peer,
            next_id: Cell::new(0),
            pending,
            outbound: RefCell::new(Some(outbound_tx)),
            reader: RefCell::new(Some(reader)),
            writer: RefCell::new(Some(writer)),
        })
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Number of calls that are awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.borrow().calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.borrow().closed
    }

    pub(crate) async fn call_raw(
        &self,
        verb: RpcVerb,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CallError> {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));

        let frame = RequestFrame {
            id,
            verb: verb.id(),
            payload,
        }
        .encode()
        .map_err(CallError::Framing)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.borrow_mut();
            if pending.closed {
                return Err(CallError::ConnectionClosed);
            }
            pending.calls.insert(id, reply_tx);
        }

        let queued = self
            .outbound
            .borrow()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !queued {
            self.pending.borrow_mut().calls.remove(&id);
            return Err(CallError::ConnectionClosed);
        }

        reply_rx.await.map_err(|_| CallError::ConnectionClosed)?
    }

    /// Close the connection.
    ///
    /// Requests already queued are flushed first. Calls still waiting
    /// for a reply fail with [`CallError::ConnectionClosed`].
    pub async fn stop(&self) {
        drop(self.outbound.borrow_mut().take());

        let writer = self.writer.borrow_mut().take();
        if let Some(writer) = writer
            && let Err(err) = writer.await
        {
            tracing::debug!("rpc client writer task did not finish cleanly: {err}");
        }

        let reader = self.reader.borrow_mut().take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }

        self.pending.borrow_mut().close();
        tracing::debug!(server.address = %self.peer, "rpc client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Rc<RefCell<Pending>>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write_frame(&mut write_half, &frame).await {
            tracing::debug!("rpc client failed to write request: {err}");
            pending.borrow_mut().close();
            return;
        }
    }

    if let Err(err) = write_half.shutdown().await {
        tracing::trace!("rpc client write shutdown: {err}");
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, pending: Rc<RefCell<Pending>>, peer: SocketAddr) {
    loop {
        match ResponseFrame::read_from(&mut read_half).await {
            Ok(Some(ResponseFrame { id, result })) => {
                let reply = pending.borrow_mut().calls.remove(&id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result.map_err(CallError::Remote));
                    }
                    None => tracing::debug!(%id, "rpc client received reply for unknown call"),
                }
            }
            Ok(None) => {
                tracing::debug!(server.address = %peer, "rpc connection closed by server");
                break;
            }
            Err(err) => {
                tracing::warn!(server.address = %peer, "rpc client connection failed: {err}");
                break;
            }
        }
    }

    pending.borrow_mut().close();
}
