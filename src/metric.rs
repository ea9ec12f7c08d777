use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::RunContext;
use crate::monitoring;
use crate::sandbox::{Capture, Invocation};
use crate::submission::{ClocResult, MetricJob, Submission};

const REPORT_FILE: &str = "metric_cloc.xml";

/// Metric-stage handler
pub async fn handle(job: MetricJob, ctx: Arc<RunContext>) {
    log::debug!("executing metric for submission {}", job.submission.id);
    let results = measure(&ctx, &job.submission).await;
    if job.reply.send(results).is_err() {
        log::warn!(
            "metric reply for {} dropped, receiver gone",
            job.submission.id
        );
    }
}

/// Counts lines of the designated file (the first allowed-files entry) with
/// cloc and parses its XML report.
async fn measure(ctx: &RunContext, submission: &Submission) -> Vec<ClocResult> {
    let Some(test_file) = submission.config.allowed_files.first() else {
        // no file designated, nothing to measure
        return Vec::new();
    };

    if let Err(e) = run(ctx, submission, test_file).await {
        log::error!(
            "error executing cloc metric for test {}: {e}",
            submission.test_name
        );
        monitoring::inc_error("metric");
        return Vec::new();
    }

    match parse_report(&submission.run_dir.join(REPORT_FILE)) {
        Ok(results) => results,
        Err(e) => {
            log::error!(
                "error parsing cloc metric result for test {}: {e}",
                submission.test_name
            );
            monitoring::inc_error("metric");
            Vec::new()
        }
    }
}

async fn run(ctx: &RunContext, submission: &Submission, test_file: &str) -> Result<()> {
    let run_dir = &submission.run_dir;

    let mut inv = Invocation::new(
        format!("{}-analysis-cloc", submission.id),
        &ctx.images.cloc,
        run_dir.clone(),
    );
    inv.timeout = Duration::from_secs(submission.config.analysis_timeout_s());
    inv.memory_mb = Some(submission.config.analysis_mem_mb());
    inv.stdout = Capture::File(run_dir.join(REPORT_FILE));
    inv.stderr = Capture::Buffer;
    inv.command = vec![
        "--quiet".to_string(),
        "--xml".to_string(),
        format!("/code/{test_file}"),
        "--exclude-dir=bin,obj,TestResults".to_string(),
        "--by-file".to_string(),
    ];

    match inv.run().await {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => {
            let stderr = out.stderr_lossy();
            if stderr.is_empty() {
                bail!("exit status {}", out.status.code().unwrap_or(-1));
            }
            bail!("{stderr}")
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_report(path: &Path) -> Result<Vec<ClocResult>> {
    let content = std::fs::read_to_string(path)?;
    parse_results(&content)
}

/// Maps cloc's per-file records into the generic shape.
pub(crate) fn parse_results(xml: &str) -> Result<Vec<ClocResult>> {
    let doc = roxmltree::Document::parse(xml)?;

    let mut results = Vec::new();
    for files_node in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "files")
    {
        for file_node in files_node
            .children()
            .filter(|c| c.tag_name().name() == "file")
        {
            results.push(ClocResult {
                name: file_node.attribute("name").unwrap_or_default().to_string(),
                comments_number: file_node
                    .attribute("comment")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                loc_number: file_node
                    .attribute("code")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
            });
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0"?>
<results>
  <header cloc_version="1.82" files_count="1"/>
  <files>
    <file name="/code/Main.java" blank="4" comment="12" code="57" language="Java"/>
    <total blank="4" comment="12" code="57"/>
  </files>
</results>"#;

    #[test]
    fn maps_cloc_records() {
        let results = parse_results(REPORT).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "/code/Main.java");
        assert_eq!(results[0].comments_number, 12);
        assert_eq!(results[0].loc_number, 57);
    }

    #[test]
    fn unparseable_report_is_an_error() {
        assert!(parse_results("<results>").is_err());
    }
}
