use rama::error::{BoxError, ErrorContext as _};
use rpc_tester_lib::report::ShardReport;

use super::Reporter;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn render(&self, reports: &[ShardReport]) -> Result<String, BoxError> {
        let mut output = serde_json::to_string_pretty(reports).context("serialize json report")?;
        output.push('\n');
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::tests::reports;

    #[test]
    fn test_json_report_roundtrips_as_value() {
        let output = JsonReporter.render(&reports()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value[0]["shard"], 0);
        assert_eq!(value[0]["e1"]["messages"], 2000);
        assert_eq!(value[0]["e1"]["latencies"]["p0.999"], 300);
        assert_eq!(value[1], serde_json::json!({"shard": 1}));
    }
}
