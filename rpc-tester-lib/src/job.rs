//! Load generating jobs.
//!
//! A [`Job`] drives `parallelism` concurrent call loops against a shared
//! [`Client`] until its deadline passes, recording the latency of every
//! completed call.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use futures::future::join_all;
use rama::{
    error::{BoxError, ErrorExt as _},
    telemetry::tracing,
};
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::{
    config::{ConfigError, JOB_TYPE_RPC, JobConfig},
    protocol::{CallError, Client, ECHO},
    report::ResultSink,
    sched::SchedulingGroup,
    stats::LatencyAccumulator,
};

/// What a job issues on every iteration of its call loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Rpc(RpcCall),
}

impl JobKind {
    pub fn from_config(cfg: &JobConfig) -> Result<Self, ConfigError> {
        if cfg.kind != JOB_TYPE_RPC {
            return Err(ConfigError::UnknownJobType(cfg.kind.clone()));
        }
        cfg.validate()?;
        let verb = cfg.verb.as_deref().unwrap_or_default();
        Ok(Self::Rpc(RpcCall::from_verb(verb)?))
    }

    async fn issue(self, client: &Client, loop_index: u32) -> Result<(), CallError> {
        match self {
            Self::Rpc(call) => call.issue(client, loop_index).await,
        }
    }
}

/// Remote calls an rpc job can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCall {
    /// Round trip of a fixed value, the reply is discarded.
    Echo,
}

impl RpcCall {
    pub fn from_verb(verb: &str) -> Result<Self, ConfigError> {
        match verb {
            "echo" => Ok(Self::Echo),
            _ => Err(ConfigError::UnknownVerb(verb.to_owned())),
        }
    }

    async fn issue(self, client: &Client, loop_index: u32) -> Result<(), CallError> {
        match self {
            Self::Echo => ECHO.call(client, &u64::from(loop_index)).await.map(drop),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Created,
    Running,
    Finished,
}

/// Create a job bound to a client.
///
/// The deadline is computed here: the job stops issuing new calls once
/// `cfg.duration` has passed since construction.
pub fn make_job(
    cfg: JobConfig,
    client: Rc<Client>,
    group: SchedulingGroup,
) -> Result<Job, ConfigError> {
    let kind = JobKind::from_config(&cfg)?;
    let parallelism = cfg.parallelism.unwrap_or(1);
    let deadline = Instant::now() + cfg.duration;
    Ok(Job {
        cfg,
        kind,
        parallelism,
        deadline,
        client,
        group,
        state: Cell::new(JobState::Created),
        messages: Cell::new(0),
        failed_loops: Cell::new(0),
        latencies: RefCell::new(LatencyAccumulator::new()),
    })
}

pub struct Job {
    cfg: JobConfig,
    kind: JobKind,
    parallelism: u32,
    deadline: Instant,
    client: Rc<Client>,
    group: SchedulingGroup,
    state: Cell<JobState>,
    messages: Cell<u64>,
    failed_loops: Cell<u32>,
    latencies: RefCell<LatencyAccumulator>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.cfg.name)
            .field("kind", &self.kind)
            .field("parallelism", &self.parallelism)
            .field("state", &self.state.get())
            .field("messages", &self.messages.get())
            .finish()
    }
}

impl Job {
    #[inline]
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn group(&self) -> &SchedulingGroup {
        &self.group
    }

    /// Calls issued so far, including calls that failed.
    pub fn messages(&self) -> u64 {
        self.messages.get()
    }

    /// Call loops that ended early because a call failed.
    pub fn failed_loops(&self) -> u32 {
        self.failed_loops.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state.get() == JobState::Finished
    }

    /// Run all call loops until the deadline has passed.
    ///
    /// Calls still in flight at the deadline are completed and recorded.
    /// A failed call ends its own loop only. Fails if the job already ran.
    pub async fn run(&self) -> Result<(), BoxError> {
        if self.state.get() != JobState::Created {
            return Err(BoxError::from("job can only be run once")
                .context_str_field("job", self.name()));
        }
        self.state.set(JobState::Running);

        tracing::info!(
            job.name = %self.cfg.name,
            job.parallelism = self.parallelism,
            sched.shares = self.group.shares(),
            "job started",
        );

        self.group
            .run(join_all((0..self.parallelism).map(|index| self.call_loop(index))))
            .await;

        self.state.set(JobState::Finished);
        tracing::info!(
            job.name = %self.cfg.name,
            job.messages = self.messages.get(),
            job.failed_loops = self.failed_loops.get(),
            "job finished",
        );
        Ok(())
    }

    async fn call_loop(&self, index: u32) {
        while Instant::now() < self.deadline {
            self.messages.set(self.messages.get() + 1);
            let start = Instant::now();
            if let Err(err) = self.kind.issue(&self.client, index).await {
                tracing::warn!(
                    job.name = %self.cfg.name,
                    job.call_loop = index,
                    "call failed, end call loop early: {err}",
                );
                self.failed_loops.set(self.failed_loops.get() + 1);
                return;
            }
            let micros = start.elapsed().as_micros().min(u64::MAX as u128) as u64;
            self.latencies.borrow_mut().record(micros);
        }
    }

    /// Write `messages` and `latencies` into the sink.
    pub fn emit_result(&self, sink: &mut ResultSink) -> Result<(), BoxError> {
        if !self.is_finished() {
            return Err(BoxError::from("job result emitted before the job finished")
                .context_str_field("job", self.name()));
        }

        let summary = self.latencies.borrow().summary();
        let mut latencies = ResultSink::new();
        latencies.insert("average".to_owned(), summary.average.into());
        for (key, value) in summary.quantile_entries() {
            latencies.insert(key, value.into());
        }
        latencies.insert("max".to_owned(), summary.max.into());

        sink.insert("messages".to_owned(), json!(self.messages.get()));
        sink.insert("latencies".to_owned(), Value::Object(latencies));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{ClientOptions, Protocol, RpcVerb, Server, ServerOptions};

    use rama::telemetry::tracing;
    use tracing_test::traced_test;

    async fn echo_server(protocol: Protocol) -> (Server, Rc<Client>) {
        let server = Server::bind(
            Rc::new(protocol),
            "127.0.0.1:0".parse().unwrap(),
            ServerOptions::default(),
        )
        .unwrap();
        let client = Client::connect(server.local_addr(), ClientOptions::default())
            .await
            .unwrap();
        (server, Rc::new(client))
    }

    fn echo_protocol() -> Protocol {
        let protocol = Protocol::new();
        protocol.register_handler(RpcVerb::Echo, |v: u64| async move { v });
        protocol
    }

    #[test]
    fn test_job_kind_from_config() {
        for (cfg, expected) in [
            (
                JobConfig::rpc("a", "echo", 2),
                Ok(JobKind::Rpc(RpcCall::Echo)),
            ),
            (
                JobConfig::rpc("b", "ping", 2),
                Err(ConfigError::UnknownVerb("ping".to_owned())),
            ),
            (
                JobConfig {
                    kind: "cpu".to_owned(),
                    ..JobConfig::rpc("c", "echo", 2)
                },
                Err(ConfigError::UnknownJobType("cpu".to_owned())),
            ),
            (
                JobConfig::rpc("d", "echo", 0),
                Err(ConfigError::InvalidParallelism {
                    job: "d".to_owned(),
                }),
            ),
        ] {
            assert_eq!(JobKind::from_config(&cfg), expected, "cfg: {cfg:?}");
        }
    }

    #[tokio::test]
    async fn test_make_job_rejects_unknown_type_and_verb() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (server, client) = echo_server(echo_protocol()).await;

                let cfg = JobConfig {
                    kind: "disk".to_owned(),
                    ..JobConfig::rpc("x", "echo", 1)
                };
                let err = make_job(cfg, client.clone(), SchedulingGroup::default()).unwrap_err();
                assert_eq!(err, ConfigError::UnknownJobType("disk".to_owned()));

                let cfg = JobConfig::rpc("y", "unknown", 1);
                let err = make_job(cfg, client.clone(), SchedulingGroup::default()).unwrap_err();
                assert_eq!(err, ConfigError::UnknownVerb("unknown".to_owned()));

                client.stop().await;
                server.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_job_runs_until_deadline() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (server, client) = echo_server(echo_protocol()).await;

                let cfg = JobConfig::rpc("e1", "echo", 4).with_duration(Duration::from_millis(300));
                let job = make_job(cfg, client.clone(), SchedulingGroup::new("e1", 100)).unwrap();
                assert_eq!(job.name(), "e1");
                assert!(job.emit_result(&mut ResultSink::new()).is_err());

                job.run().await.unwrap();
                assert!(Instant::now() >= job.deadline());
                assert!(job.is_finished());
                assert!(job.messages() > 0);
                assert_eq!(job.failed_loops(), 0);
                assert!(job.group().runtime() > Duration::ZERO);

                let mut sink = ResultSink::new();
                job.emit_result(&mut sink).unwrap();
                assert_eq!(sink["messages"], job.messages());
                let latencies = sink["latencies"].as_object().unwrap();
                assert_eq!(
                    latencies.keys().map(String::as_str).collect::<Vec<_>>(),
                    ["average", "p0.5", "p0.95", "p0.99", "p0.999", "max"]
                );
                let max = latencies["max"].as_u64().unwrap();
                assert!(max >= latencies["average"].as_u64().unwrap());
                assert!(max >= latencies["p0.999"].as_u64().unwrap());

                client.stop().await;
                server.stop().await;
            })
            .await;
    }

    fn slow_echo_protocol(delay: Duration) -> Protocol {
        let protocol = Protocol::new();
        protocol.register_handler(RpcVerb::Echo, move |v: u64| async move {
            tokio::time::sleep(delay).await;
            v
        });
        protocol
    }

    #[tokio::test]
    async fn test_call_loops_keep_calls_outstanding_concurrently() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (server, client) =
                    echo_server(slow_echo_protocol(Duration::from_millis(100))).await;

                let cfg = JobConfig::rpc("wide", "echo", 4).with_duration(Duration::from_millis(350));
                let job = make_job(cfg, client.clone(), SchedulingGroup::default()).unwrap();

                let (result, in_flight) = tokio::join!(job.run(), async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    client.in_flight()
                });
                result.unwrap();
                assert_eq!(in_flight, 4);

                // four loops of about four calls each, one loop alone would reach four
                assert!(job.messages() >= 12, "messages: {}", job.messages());
                assert_eq!(job.failed_loops(), 0);

                client.stop().await;
                server.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_call_in_flight_at_deadline_is_completed_and_recorded() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (server, client) =
                    echo_server(slow_echo_protocol(Duration::from_millis(300))).await;

                let cfg = JobConfig::rpc("slow", "echo", 1).with_duration(Duration::from_millis(50));
                let job = make_job(cfg, client.clone(), SchedulingGroup::default()).unwrap();

                let started = Instant::now();
                job.run().await.unwrap();
                assert!(started.elapsed() >= Duration::from_millis(300));
                assert_eq!(job.messages(), 1);
                assert_eq!(client.in_flight(), 0);

                let mut sink = ResultSink::new();
                job.emit_result(&mut sink).unwrap();
                assert_eq!(sink["messages"], 1);
                let max = sink["latencies"]["max"].as_u64().unwrap();
                assert!(max >= 300_000, "max: {max}us");
                assert_eq!(sink["latencies"]["p0.5"], max);

                client.stop().await;
                server.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_job_runs_only_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (server, client) = echo_server(echo_protocol()).await;

                let cfg = JobConfig::rpc("once", "echo", 1).with_duration(Duration::from_millis(20));
                let job = make_job(cfg, client.clone(), SchedulingGroup::default()).unwrap();
                job.run().await.unwrap();
                let messages = job.messages();

                assert!(job.run().await.is_err());
                assert_eq!(job.messages(), messages);

                client.stop().await;
                server.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_expired_deadline_issues_no_calls() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (server, client) = echo_server(echo_protocol()).await;

                let job = make_job(
                    JobConfig::rpc("zero", "echo", 3),
                    client.clone(),
                    SchedulingGroup::default(),
                )
                .unwrap();
                job.run().await.unwrap();
                assert_eq!(job.messages(), 0);

                let mut sink = ResultSink::new();
                job.emit_result(&mut sink).unwrap();
                assert_eq!(sink["messages"], 0);
                assert_eq!(sink["latencies"]["max"], 0);

                client.stop().await;
                server.stop().await;
            })
            .await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_call_ends_its_loop_only() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // no echo handler: every call gets an error reply
                let (server, client) = echo_server(Protocol::new()).await;

                let cfg = JobConfig::rpc("broken", "echo", 3).with_duration(Duration::from_secs(5));
                let job = make_job(cfg, client.clone(), SchedulingGroup::default()).unwrap();

                let started = std::time::Instant::now();
                job.run().await.unwrap();
                assert!(started.elapsed() < Duration::from_secs(5));

                assert_eq!(job.failed_loops(), 3);
                assert_eq!(job.messages(), 3);
                assert!(logs_contain("call failed, end call loop early"));

                let mut sink = ResultSink::new();
                job.emit_result(&mut sink).unwrap();
                assert_eq!(sink["latencies"]["average"], 0);

                client.stop().await;
                server.stop().await;
            })
            .await;
    }
}
