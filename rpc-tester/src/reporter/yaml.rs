use rama::error::{BoxError, ErrorContext as _};
use rpc_tester_lib::report::ShardReport;

use super::Reporter;

/// `- shard: 0\n  <job>:\n    messages: ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlReporter;

impl Reporter for YamlReporter {
    fn render(&self, reports: &[ShardReport]) -> Result<String, BoxError> {
        serde_yaml::to_string(reports).context("serialize yaml report")
    }
}
