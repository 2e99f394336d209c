//! `storm research`: one unattended run written to a markdown file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use storm_core::models::{ResearchResult, ResearchTask, DEFAULT_ANALYSTS, DEFAULT_INTERVIEW_TURNS};
use storm_llm::{ModelConfig, ProviderKind};

/// Longest topic fragment used in a generated file name.
const FILE_STEM_CHARS: usize = 30;

#[derive(Debug, Args)]
pub struct ResearchArgs {
    /// Research topic.
    #[arg(long)]
    pub topic: String,

    #[arg(long, default_value_t = DEFAULT_ANALYSTS)]
    pub max_analysts: usize,

    #[arg(long, default_value_t = DEFAULT_INTERVIEW_TURNS)]
    pub max_interview_turns: usize,

    /// Interview analysts concurrently.
    #[arg(long)]
    pub parallel: bool,

    /// Model backend; defaults to the server's default provider.
    #[arg(long)]
    pub provider: Option<ProviderKind>,

    /// Where to write the report. Defaults to `research_report_<topic>.md`.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

impl ResearchArgs {
    fn task(&self) -> anyhow::Result<ResearchTask> {
        let task = ResearchTask::new(self.topic.as_str())?
            .with_max_analysts(self.max_analysts)?
            .with_max_interview_turns(self.max_interview_turns)?
            .with_parallel_interviews(self.parallel);
        Ok(task)
    }

    fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| default_output_path(&self.topic))
    }
}

/// `research_report_<topic>.md`, with whitespace turned into underscores and
/// the topic cut to a bounded length.
pub fn default_output_path(topic: &str) -> PathBuf {
    let stem: String = topic
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' || c == '\\' { '_' } else { c })
        .take(FILE_STEM_CHARS)
        .collect();
    PathBuf::from(format!("research_report_{stem}.md"))
}

/// Run the workflow with no operator and write the final report.
pub async fn run(args: ResearchArgs, default_provider: ProviderKind) -> anyhow::Result<(ResearchResult, PathBuf)> {
    let task = args.task()?;
    let provider = args.provider.unwrap_or(default_provider);
    let pipeline = storm_server::pipeline_for_config(ModelConfig::from_env(provider))
        .with_context(|| format!("cannot use provider {provider}"))?;

    tracing::info!(
        topic = task.topic(),
        analysts = task.max_analysts(),
        turns = task.max_interview_turns(),
        parallel = task.parallel_interviews(),
        provider = %provider,
        "starting unattended research"
    );
    let result = storm_engine::run_unattended(task, pipeline)
        .await
        .context("research failed")?;

    let path = args.output_path();
    write_report(&path, &result.final_report).await?;
    tracing::info!(path = %path.display(), analysts = result.analysts.len(), "report written");
    Ok((result, path))
}

async fn write_report(path: &Path, report: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, report)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
