use std::{fmt::Write as _, time::Duration};

use rama::error::BoxError;
use rpc_tester_lib::report::ShardReport;

use super::Reporter;

pub struct HumanReporter {
    duration: Duration,
}

impl HumanReporter {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    fn rate(&self, messages: u64) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0. {
            0.
        } else {
            messages as f64 / secs
        }
    }
}

impl Reporter for HumanReporter {
    fn render(&self, reports: &[ShardReport]) -> Result<String, BoxError> {
        let mut output = String::new();
        let mut total = 0;

        for report in reports {
            if report.jobs.is_empty() {
                writeln!(output, "shard={} no jobs", report.shard)?;
                continue;
            }
            for name in report.jobs.keys() {
                let Some(job) = report.job(name) else {
                    continue;
                };
                total += job.messages();
                write!(
                    output,
                    "shard={} job={} messages={} rate={:.1}/s",
                    report.shard,
                    name,
                    job.messages(),
                    self.rate(job.messages()),
                )?;
                for (key, micros) in job.latencies() {
                    write!(output, " {key}={micros}us")?;
                }
                output.push('\n');
            }
        }

        writeln!(
            output,
            "done shards={} messages={} rate={:.1}/s duration={}",
            reports.len(),
            total,
            self.rate(total),
            humantime::format_duration(self.duration),
        )?;
        Ok(output)
    }
}
