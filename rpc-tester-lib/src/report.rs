//! Result sinks and per-shard reports.

use serde::Serialize;
use serde_json::Value;

/// Structured key-value sink results are emitted into.
///
/// Insertion order is kept, so jobs are reported in configuration order.
pub type ResultSink = serde_json::Map<String, Value>;

/// Results of one shard: job name to `{messages, latencies}`.
///
/// Serializes flat, as `{shard: 0, <job>: {...}, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShardReport {
    pub shard: usize,
    #[serde(flatten)]
    pub jobs: ResultSink,
}

impl ShardReport {
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            jobs: ResultSink::new(),
        }
    }

    pub fn job(&self, name: &str) -> Option<JobResultView<'_>> {
        self.jobs.get(name).map(JobResultView)
    }

    /// Total messages issued by all jobs of this shard.
    pub fn total_messages(&self) -> u64 {
        self.jobs
            .values()
            .map(|job| JobResultView(job).messages())
            .sum()
    }
}

/// Read access to one emitted job result.
#[derive(Debug, Clone, Copy)]
pub struct JobResultView<'a>(&'a Value);

impl<'a> JobResultView<'a> {
    pub fn messages(&self) -> u64 {
        self.0.get("messages").and_then(Value::as_u64).unwrap_or(0)
    }

    /// Latency entry in microseconds, e.g. `average`, `p0.99` or `max`.
    pub fn latency(&self, key: &str) -> Option<u64> {
        self.0.get("latencies")?.get(key)?.as_u64()
    }

    /// All latency entries, in emission order.
    pub fn latencies(&self) -> impl Iterator<Item = (&'a str, u64)> + 'a {
        self.0
            .get("latencies")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|latencies| latencies.iter())
            .filter_map(|(key, value)| Some((key.as_str(), value.as_u64()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> ShardReport {
        let mut report = ShardReport::new(1);
        report.jobs.insert(
            "e1".to_owned(),
            json!({
                "messages": 10,
                "latencies": {"average": 5, "p0.5": 4, "max": 9},
            }),
        );
        report.jobs.insert(
            "e2".to_owned(),
            json!({"messages": 3, "latencies": {"average": 1, "max": 2}}),
        );
        report
    }

    #[test]
    fn test_serializes_flat() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["shard"], 1);
        assert_eq!(value["e1"]["messages"], 10);
        assert_eq!(value["e2"]["latencies"]["max"], 2);
    }

    #[test]
    fn test_job_view() {
        let report = report();
        let e1 = report.job("e1").unwrap();
        assert_eq!(e1.messages(), 10);
        assert_eq!(e1.latency("p0.5"), Some(4));
        assert_eq!(e1.latency("p0.99"), None);
        assert_eq!(
            e1.latencies().collect::<Vec<_>>(),
            [("average", 5), ("p0.5", 4), ("max", 9)]
        );
        assert!(report.job("e3").is_none());
        assert_eq!(report.total_messages(), 13);
    }
}
