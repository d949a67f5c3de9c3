//! Multi-shard driver.
//!
//! Every shard gets its own OS thread running a current-thread tokio
//! runtime and a `LocalSet`, so that nothing within a shard runs in
//! parallel. Shards move through their phases in lock step:
//! start, barrier, run and emit, barrier, stop.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use rama::{
    error::{BoxError, ErrorExt as _},
    telemetry::tracing::{self, Instrument as _},
};
use tokio::sync::{Barrier, oneshot};

use crate::{
    config::Config,
    report::ShardReport,
    sched::SchedulingGroupRegistry,
    shard::{ByeSignal, ShardContext, ShardOptions},
};

#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    pub listen: Option<SocketAddr>,
    pub connect: Option<SocketAddr>,
    pub shards: usize,
    /// Run length applied to every job.
    pub duration: Duration,
}

#[derive(Debug)]
pub struct Driver {
    options: DriverOptions,
    config: Config,
    groups: SchedulingGroupRegistry,
}

enum ShardOutcome {
    Report(ShardReport),
    StartFailed(BoxError),
    Failed(BoxError),
    Aborted,
}

impl Driver {
    /// Create a driver; the run duration is applied to all jobs of `config`.
    pub fn new(options: DriverOptions, config: Config) -> Self {
        let config = config.with_duration(options.duration);
        let groups = SchedulingGroupRegistry::new();
        for job in &config.jobs {
            groups.get_or_create(&job.name, job.shares);
        }
        Self {
            options: DriverOptions {
                shards: options.shards.max(1),
                ..options
            },
            config,
            groups,
        }
    }

    pub fn groups(&self) -> &SchedulingGroupRegistry {
        &self.groups
    }

    /// Run all shards to completion and collect their reports, in shard order.
    ///
    /// If any shard fails to start, no shard runs its jobs and the first
    /// start error is returned.
    pub async fn run(self) -> Result<Vec<ShardReport>, BoxError> {
        self.run_with_spawner(spawn_shard_thread).await
    }

    async fn run_with_spawner<S>(self, mut spawn: S) -> Result<Vec<ShardReport>, BoxError>
    where
        S: FnMut(ShardPhases, oneshot::Sender<ShardOutcome>) -> io::Result<()>,
    {
        let shards = self.options.shards;
        tracing::info!(
            shards,
            listen = ?self.options.listen,
            connect = ?self.options.connect,
            duration = ?self.options.duration,
            jobs = self.config.jobs.len(),
            "starting shards",
        );

        let barrier = Arc::new(Barrier::new(shards));
        let start_failed = Arc::new(AtomicBool::new(false));
        let bye = ByeSignal::new();

        let mut outcomes = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = oneshot::channel();
            let phases = ShardPhases {
                options: ShardOptions {
                    shard,
                    shards,
                    listen: self.options.listen,
                    connect: self.options.connect,
                },
                config: self.config.clone(),
                groups: self.groups.clone(),
                bye: bye.clone(),
                barrier: barrier.clone(),
                start_failed: start_failed.clone(),
            };

            if let Err(err) = spawn(phases, tx) {
                tracing::error!(shard, "failed to spawn shard thread: {err}");
                start_failed.store(true, Ordering::Release);
                // stand in at both barriers for the shards without a thread
                join_all((shard..shards).map(|_| async {
                    barrier.wait().await;
                    barrier.wait().await;
                }))
                .await;
                for rx in outcomes {
                    let _ = rx.await;
                }
                return Err(err
                    .context("spawn shard thread")
                    .context_field("shard", shard));
            }
            outcomes.push(rx);
        }

        let mut reports = Vec::with_capacity(shards);
        let mut start_error = None;
        let mut run_error = None;
        for (shard, rx) in outcomes.into_iter().enumerate() {
            match rx.await {
                Ok(ShardOutcome::Report(report)) => reports.push(report),
                Ok(ShardOutcome::StartFailed(err)) => {
                    start_error.get_or_insert(err);
                }
                Ok(ShardOutcome::Failed(err)) => {
                    run_error.get_or_insert(err);
                }
                Ok(ShardOutcome::Aborted) => {
                    tracing::debug!(shard, "shard aborted: another shard failed to start");
                }
                Err(_) => {
                    run_error.get_or_insert_with(|| {
                        BoxError::from("shard thread exited without result")
                    });
                }
            }
        }

        if let Some(err) = start_error.or(run_error) {
            return Err(err);
        }
        Ok(reports)
    }
}

fn spawn_shard_thread(phases: ShardPhases, tx: oneshot::Sender<ShardOutcome>) -> io::Result<()> {
    std::thread::Builder::new()
        .name(format!("rpc-shard-{}", phases.options.shard))
        .spawn(move || {
            let _ = tx.send(phases.run_on_thread());
        })
        .map(drop)
}

struct ShardPhases {
    options: ShardOptions,
    config: Config,
    groups: SchedulingGroupRegistry,
    bye: ByeSignal,
    barrier: Arc<Barrier>,
    start_failed: Arc<AtomicBool>,
}

impl ShardPhases {
    fn run_on_thread(self) -> ShardOutcome {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                // the other shards still wait on both barriers
                self.start_failed.store(true, Ordering::Release);
                futures::executor::block_on(async {
                    self.barrier.wait().await;
                    self.barrier.wait().await;
                });
                return ShardOutcome::StartFailed(
                    err.context("build shard runtime")
                        .context_field("shard", self.options.shard),
                );
            }
        };

        let span = tracing::info_span!("shard", shard.index = self.options.shard);
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, self.run().instrument(span))
    }

    async fn run(self) -> ShardOutcome {
        let index = self.options.shard;
        let mut shard =
            ShardContext::new(self.options, self.config, self.groups).with_bye_signal(self.bye);

        let started = shard.start().await;
        if started.is_err() {
            self.start_failed.store(true, Ordering::Release);
        }
        self.barrier.wait().await;

        let outcome = match started {
            Err(err) => {
                tracing::error!("shard failed to start: {err}");
                ShardOutcome::StartFailed(err)
            }
            Ok(()) if self.start_failed.load(Ordering::Acquire) => ShardOutcome::Aborted,
            Ok(()) => match run_and_emit(&mut shard, index).await {
                Ok(report) => ShardOutcome::Report(report),
                Err(err) => {
                    tracing::error!("shard failed: {err}");
                    ShardOutcome::Failed(err)
                }
            },
        };

        self.barrier.wait().await;
        shard.stop().await;
        outcome
    }
}

async fn run_and_emit(shard: &mut ShardContext, index: usize) -> Result<ShardReport, BoxError> {
    shard.run().await?;
    let mut report = ShardReport::new(index);
    shard.emit_result(&mut report.jobs)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn idle_driver(shards: usize) -> Driver {
        Driver::new(
            DriverOptions {
                listen: None,
                connect: None,
                shards,
                duration: Duration::from_secs(1),
            },
            Config::default(),
        )
    }

    #[tokio::test]
    async fn test_idle_shards_report_empty() {
        let reports = tokio::time::timeout(Duration::from_secs(10), idle_driver(3).run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.jobs.is_empty()));
    }

    #[tokio::test]
    async fn test_shard_count_is_at_least_one() {
        let reports = idle_driver(0).run().await.unwrap();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_running_shards() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let spawner = {
            let spawned = spawned.clone();
            move |phases: ShardPhases, tx: oneshot::Sender<ShardOutcome>| {
                if phases.options.shard == 2 {
                    return Err(io::Error::other("thread limit reached"));
                }
                spawned.fetch_add(1, Ordering::AcqRel);
                spawn_shard_thread(phases, tx)
            }
        };

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            idle_driver(4).run_with_spawner(spawner),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.to_string().contains("spawn shard thread"), "{err}");
        assert_eq!(spawned.load(Ordering::Acquire), 2);
    }
}
