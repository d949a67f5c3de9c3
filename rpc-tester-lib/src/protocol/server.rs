use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tokio::{
    io::AsyncWriteExt as _,
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::{
    Protocol,
    frame::{RequestFrame, ResponseFrame, write_frame},
};

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub nodelay: bool,
    /// Allow multiple shards (sockets) to bind the same address.
    pub reuse_port: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            reuse_port: false,
        }
    }
}

const LISTEN_BACKLOG: u32 = 1024;

/// Rpc server serving the handlers of a [`Protocol`].
///
/// Each accepted connection gets its own reader and writer task,
/// and every request is handled in its own task so that slow
/// handlers do not block the connection.
pub struct Server {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    acceptor: RefCell<Option<JoinHandle<()>>>,
    connections: Rc<RefCell<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Server {
    /// Bind and start serving; must be called from within a `LocalSet`.
    pub fn bind(
        protocol: Rc<Protocol>,
        addr: SocketAddr,
        opts: ServerOptions,
    ) -> Result<Self, BoxError> {
        let listener = bind_listener(addr, opts)
            .context("bind rpc server")
            .context_field("address", addr)?;
        let local_addr = listener
            .local_addr()
            .context("fetch local addr of bound rpc server")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let connections = Rc::new(RefCell::new(Vec::new()));

        let acceptor = tokio::task::spawn_local(accept_loop(
            listener,
            protocol,
            opts,
            stop_rx,
            connections.clone(),
        ));

        tracing::info!(
            server.service.name = crate::utils::env::project_name(),
            server.address = %local_addr,
            nodelay = opts.nodelay,
            reuse_port = opts.reuse_port,
            "rpc server ready",
        );

        Ok(Self {
            local_addr,
            stop_tx,
            acceptor: RefCell::new(Some(acceptor)),
            connections,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close all open connections.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let acceptor = self.acceptor.borrow_mut().take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.await;
        }

        let connections = std::mem::take(&mut *self.connections.borrow_mut());
        for connection in connections {
            let _ = connection.await;
        }

        tracing::info!(server.address = %self.local_addr, "rpc server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.get_mut().take() {
            acceptor.abort();
        }
        for connection in self.connections.borrow_mut().drain(..) {
            connection.abort();
        }
    }
}

fn bind_listener(addr: SocketAddr, opts: ServerOptions) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;

    #[cfg(all(
        unix,
        not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))
    ))]
    if opts.reuse_port {
        socket.set_reuseport(true)?;
    }

    #[cfg(not(all(
        unix,
        not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))
    )))]
    if opts.reuse_port {
        tracing::warn!("SO_REUSEPORT is not supported on this platform: ignore");
    }

    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Rc<Protocol>,
    opts: ServerOptions,
    mut stop_rx: watch::Receiver<bool>,
    connections: Rc<RefCell<Vec<JoinHandle<()>>>>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => {
                tracing::debug!("rpc server acceptor: stop requested");
                return;
            }
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("rpc server failed to accept connection: {err}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            }
        };

        if let Err(err) = stream.set_nodelay(opts.nodelay) {
            tracing::debug!(client.address = %peer, "failed to set TCP_NODELAY: {err}");
        }
        tracing::debug!(client.address = %peer, "rpc connection accepted");

        let handle = tokio::task::spawn_local(serve_connection(
            protocol.clone(),
            stream,
            peer,
            stop_rx.clone(),
        ));

        let mut connections = connections.borrow_mut();
        connections.retain(|handle| !handle.is_finished());
        connections.push(handle);
    }
}

async fn serve_connection(
    protocol: Rc<Protocol>,
    stream: TcpStream,
    peer: SocketAddr,
    mut stop_rx: watch::Receiver<bool>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::task::spawn_local(async move {
        while let Some(frame) = reply_rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &frame).await {
                tracing::debug!("rpc server failed to write reply: {err}");
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    loop {
        let frame = tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => {
                tracing::debug!(client.address = %peer, "close rpc connection: server stopping");
                break;
            }
            result = RequestFrame::read_from(&mut read_half) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!(client.address = %peer, "rpc connection closed by client");
                    break;
                }
                Err(err) => {
                    tracing::warn!(client.address = %peer, "close rpc connection: {err}");
                    break;
                }
            }
        };

        match protocol.dispatch(frame) {
            Ok(reply) => {
                let reply_tx = reply_tx.clone();
                tokio::task::spawn_local(async move {
                    let reply = reply.await;
                    let id = reply.id;
                    let frame = reply.encode().or_else(|err| {
                        tracing::warn!(client.address = %peer, %id, "rpc reply not sent: {err}");
                        ResponseFrame {
                            id,
                            result: Err(err.to_string()),
                        }
                        .encode()
                    });
                    match frame {
                        Ok(frame) => {
                            let _ = reply_tx.send(frame);
                        }
                        Err(err) => {
                            tracing::warn!(client.address = %peer, %id, "rpc error reply not sent: {err}");
                        }
                    }
                });
            }
            Err(err) => {
                tracing::warn!(client.address = %peer, "close rpc connection: {err}");
                break;
            }
        }
    }

    // replies of handlers still in flight are flushed before the write half closes
    drop(reply_tx);
    let _ = writer.await;
}
