use std::io::Write as _;

use rama::error::{BoxError, ErrorContext as _};
use rpc_tester_lib::report::ShardReport;

mod human;
mod json;
mod yaml;

pub use self::{human::HumanReporter, json::JsonReporter, yaml::YamlReporter};

/// Renders the merged shard reports of a run.
pub trait Reporter {
    fn render(&self, reports: &[ShardReport]) -> Result<String, BoxError>;

    /// Render to stdout.
    fn finish(&self, reports: &[ShardReport]) -> Result<(), BoxError> {
        let output = self.render(reports)?;
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(output.as_bytes())
            .and_then(|()| stdout.flush())
            .context("write report to stdout")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    /// sequence of per-shard maps, as one yaml document
    #[default]
    Yaml,
    /// the same structure as one json document
    Json,
    /// one line per shard and job
    Human,
}

impl ReportFormat {
    pub fn reporter(self, duration: std::time::Duration) -> Box<dyn Reporter> {
        match self {
            Self::Yaml => Box::new(YamlReporter),
            Self::Json => Box::new(JsonReporter),
            Self::Human => Box::new(HumanReporter::new(duration)),
        }
    }
}
