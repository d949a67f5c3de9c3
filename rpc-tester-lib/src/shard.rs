//! One execution unit of the harness.
//!
//! A [`ShardContext`] optionally listens (serving the rpc verbs) and
//! optionally connects out to a peer, running the configured jobs over
//! that single connection. It moves through `Idle -> Started -> Running
//! -> Stopped` exactly once and must live on a single thread (`LocalSet`).

use std::{
    net::SocketAddr,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::future::join_all;
use rama::{
    error::{BoxError, ErrorContext as _, ErrorExt as _},
    telemetry::tracing,
};
use tokio::sync::watch;

use crate::{
    config::Config,
    job::{Job, make_job},
    protocol::{BYE, Client, HELLO, Protocol, RpcVerb, Server},
    report::ResultSink,
    sched::SchedulingGroupRegistry,
};

/// Role and identity of a shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardOptions {
    /// Index of this shard, in `0..shards`.
    pub shard: usize,
    pub shards: usize,
    pub listen: Option<SocketAddr>,
    pub connect: Option<SocketAddr>,
}

/// Signal a listener waits on until its peers said goodbye.
///
/// Fires once every received `HELLO` is matched by a `BYE` (and at least
/// one `BYE` arrived). Cloning shares the signal, which lets all listener
/// shards of a process finish together, wherever the connections landed.
#[derive(Debug, Clone)]
pub struct ByeSignal(Arc<ByeInner>);

#[derive(Debug)]
struct ByeInner {
    hellos: AtomicUsize,
    byes: AtomicUsize,
    done: watch::Sender<bool>,
}

impl Default for ByeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ByeSignal {
    pub fn new() -> Self {
        Self(Arc::new(ByeInner {
            hellos: AtomicUsize::new(0),
            byes: AtomicUsize::new(0),
            done: watch::Sender::new(false),
        }))
    }

    fn hello(&self) {
        self.0.hellos.fetch_add(1, Ordering::AcqRel);
    }

    fn bye(&self) {
        let byes = self.0.byes.fetch_add(1, Ordering::AcqRel) + 1;
        if byes >= self.0.hellos.load(Ordering::Acquire) {
            self.0.done.send_replace(true);
        }
    }

    pub fn is_done(&self) -> bool {
        *self.0.done.borrow()
    }

    pub async fn wait(&self) {
        let mut done = self.0.done.subscribe();
        // sender lives in self: can't be closed
        let _ = done.wait_for(|done| *done).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Idle,
    Started,
    Running,
    Stopped,
}

pub struct ShardContext {
    options: ShardOptions,
    config: Config,
    groups: SchedulingGroupRegistry,
    protocol: Rc<Protocol>,
    bye: ByeSignal,
    server: Option<Server>,
    client: Option<Rc<Client>>,
    jobs: Vec<Job>,
    state: ShardState,
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("server", &self.server)
            .field("client", &self.client)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl ShardContext {
    /// New idle shard. Job configs must already carry the run duration.
    pub fn new(options: ShardOptions, config: Config, groups: SchedulingGroupRegistry) -> Self {
        Self {
            options,
            config,
            groups,
            protocol: Rc::new(Protocol::new()),
            bye: ByeSignal::new(),
            server: None,
            client: None,
            jobs: Vec::new(),
            state: ShardState::Idle,
        }
    }

    /// Share a bye signal with other shards of this process.
    pub fn with_bye_signal(mut self, bye: ByeSignal) -> Self {
        self.bye = bye;
        self
    }

    #[inline]
    pub fn shard(&self) -> usize {
        self.options.shard
    }

    /// Address the server of this shard is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(Server::local_addr)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Register the verb handlers, bind the server and connect the client.
    ///
    /// A connecting shard says `HELLO` before its jobs are created.
    pub async fn start(&mut self) -> Result<(), BoxError> {
        self.transition(ShardState::Idle, ShardState::Started)?;
        self.register_handlers();

        if let Some(addr) = self.options.listen {
            let opts = self.config.server_options(self.options.shards > 1);
            let server = Server::bind(self.protocol.clone(), addr, opts)
                .context("start shard rpc server")
                .context_field("shard", self.options.shard)?;
            self.server = Some(server);
        }

        let Some(peer) = self.options.connect else {
            return Ok(());
        };

        let client = Rc::new(Client::connect(peer, self.config.client_options()).await?);
        self.client = Some(client.clone());

        HELLO
            .call(&client, &())
            .await
            .context("say HELLO to peer")
            .context_field("peer", peer)?;
        tracing::debug!(shard = self.options.shard, server.address = %peer, "HELLO acknowledged");

        for cfg in &self.config.jobs {
            let group = self.groups.get_or_create(&cfg.name, cfg.shares);
            match make_job(cfg.clone(), client.clone(), group) {
                Ok(job) => self.jobs.push(job),
                Err(err) => {
                    tracing::error!(shard = self.options.shard, job.name = %cfg.name, "invalid job: {err}");
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }

    fn register_handlers(&self) {
        let shard = self.options.shard;

        let bye = self.bye.clone();
        self.protocol.register_handler(RpcVerb::Hello, move |(): ()| {
            tracing::info!(shard, "got HELLO");
            bye.hello();
            async {}
        });

        let bye = self.bye.clone();
        self.protocol.register_handler(RpcVerb::Bye, move |(): ()| {
            tracing::info!(shard, "got BYE");
            bye.bye();
            async {}
        });

        self.protocol
            .register_handler(RpcVerb::Echo, |value: u64| async move { value });
    }

    /// Run all jobs concurrently, or, for a pure listener, wait for `BYE`.
    pub async fn run(&mut self) -> Result<(), BoxError> {
        self.transition(ShardState::Started, ShardState::Running)?;

        if self.client.is_some() {
            tracing::info!(shard = self.options.shard, jobs = self.jobs.len(), "run jobs");
            for result in join_all(self.jobs.iter().map(Job::run)).await {
                result?;
            }
        } else if self.server.is_some() {
            tracing::info!(shard = self.options.shard, "wait for BYE");
            self.bye.wait().await;
        }

        Ok(())
    }

    /// Write one sub-map per job, keyed by job name.
    pub fn emit_result(&self, sink: &mut ResultSink) -> Result<(), BoxError> {
        for job in &self.jobs {
            let mut result = ResultSink::new();
            job.emit_result(&mut result)?;
            sink.insert(job.name().to_owned(), result.into());
        }
        Ok(())
    }

    /// Say `BYE` (best effort) and release the client, then the server.
    ///
    /// Also releases whatever a failed [`Self::start`] left behind.
    pub async fn stop(&mut self) {
        if self.state == ShardState::Stopped {
            return;
        }
        self.state = ShardState::Stopped;

        if let Some(client) = self.client.take() {
            if client.is_closed() {
                tracing::debug!(
                    shard = self.options.shard,
                    server.address = %client.peer_addr(),
                    "connection already closed: skip BYE",
                );
            } else if let Err(err) = BYE.call(&client, &()).await {
                tracing::debug!(
                    shard = self.options.shard,
                    server.address = %client.peer_addr(),
                    "BYE failed (ignored): {err}",
                );
            }
            client.stop().await;
        }

        if let Some(server) = self.server.take() {
            server.stop().await;
        }

        tracing::debug!(shard = self.options.shard, "shard stopped");
    }

    fn transition(&mut self, from: ShardState, to: ShardState) -> Result<(), BoxError> {
        if self.state != from {
            return Err(BoxError::from("invalid shard state transition")
                .context_debug_field("state", self.state)
                .context_debug_field("expected", from));
        }
        self.state = to;
        Ok(())
    }
}
