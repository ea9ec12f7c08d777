use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::RunContext;
use crate::languages::inner_text;
use crate::monitoring;
use crate::sandbox::{Capture, Invocation, Mount};
use crate::submission::{FileWarnings, Submission, Warning};

const REPORT_FILE: &str = "analysis_pmd.xml";

/// Runs PMD with the test's rule set and parses its XML report.
///
/// PMD exits non-zero when it finds violations, so the report decides: a
/// parseable report wins over the exit status, and only an unparseable one
/// is treated as a failed run (yielding no warnings).
pub(super) async fn analyse(
    ctx: &RunContext,
    submission: &Submission,
    rules: &Path,
) -> Vec<FileWarnings> {
    let exec_err = run(ctx, submission, rules).await.err();

    match parse_report(&submission.run_dir.join(REPORT_FILE)) {
        Ok(warnings) => warnings,
        Err(parse_err) => {
            if let Some(e) = exec_err {
                log::error!(
                    "error executing pmd analysis for test {}: {e}",
                    submission.test_name
                );
            } else {
                log::error!(
                    "error parsing pmd analysis result for test {}: {parse_err}",
                    submission.test_name
                );
            }
            monitoring::inc_error("analysis");
            Vec::new()
        }
    }
}

async fn run(ctx: &RunContext, submission: &Submission, rules: &Path) -> Result<()> {
    let run_dir = &submission.run_dir;

    let mut inv = Invocation::new(
        format!("{}-analysis-pmd", submission.id),
        &ctx.images.pmd,
        run_dir.clone(),
    );
    inv.timeout = Duration::from_secs(submission.config.analysis_timeout_s());
    inv.memory_mb = Some(submission.config.analysis_mem_mb());
    inv.mounts.push(Mount {
        host: std::fs::canonicalize(rules)?,
        container: "/pmd/pmd.xml".to_string(),
        read_only: true,
    });
    inv.stdout = Capture::File(run_dir.join(REPORT_FILE));
    inv.stderr = Capture::Buffer;
    inv.command = [
        "pmd",
        "-d",
        "/code",
        "-R",
        "/pmd/pmd.xml",
        "-f",
        "xml",
        "-shortnames",
        "-no-cache",
    ]
    .map(String::from)
    .to_vec();

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

fn parse_report(path: &Path) -> Result<Vec<FileWarnings>> {
    let content = std::fs::read_to_string(path)?;
    parse_warnings(&content)
}

/// Maps a PMD report into the generic warning shape. Multi-line messages
/// are flattened because some rules emit embedded newlines.
pub(crate) fn parse_warnings(xml: &str) -> Result<Vec<FileWarnings>> {
    let doc = roxmltree::Document::parse(xml)?;

    let mut result = Vec::new();
    for file_node in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "file")
    {
        let mut file_warnings = FileWarnings {
            file: file_node.attribute("name").unwrap_or_default().to_string(),
            warnings: Vec::new(),
        };
        for violation in file_node
            .children()
            .filter(|c| c.tag_name().name() == "violation")
        {
            file_warnings.warnings.push(Warning {
                rule: violation.attribute("rule").unwrap_or_default().to_string(),
                rule_set: violation
                    .attribute("ruleset")
                    .unwrap_or_default()
                    .to_string(),
                begin_line: violation
                    .attribute("beginline")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                info_url: violation
                    .attribute("externalInfoUrl")
                    .unwrap_or_default()
                    .to_string(),
                priority: violation
                    .attribute("priority")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                message: inner_text(violation).replace('\n', ""),
            });
        }
        result.push(file_warnings);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<pmd xmlns="http://pmd.sourceforge.net/report/2.0.0" version="6.12.0">
  <file name="uploads/Main.java">
    <violation beginline="3" endline="3" rule="UnusedLocalVariable" ruleset="Best Practices" priority="3" externalInfoUrl="https://pmd.github.io/rule.html">
Avoid unused local variables
such as 'x'.
    </violation>
  </file>
</pmd>"#;

    #[test]
    fn maps_pmd_violations_into_the_generic_shape() {
        let warnings = parse_warnings(REPORT).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].file, "uploads/Main.java");

        let warning = &warnings[0].warnings[0];
        assert_eq!(warning.rule, "UnusedLocalVariable");
        assert_eq!(warning.rule_set, "Best Practices");
        assert_eq!(warning.begin_line, 3);
        assert_eq!(warning.priority, 3);
        assert_eq!(warning.info_url, "https://pmd.github.io/rule.html");
        // the embedded newlines are gone
        assert!(!warning.message.contains('\n'));
        assert!(warning.message.contains("Avoid unused local variables"));
    }

    #[test]
    fn unparseable_report_is_an_error() {
        assert!(parse_warnings("not xml at all").is_err());
    }
}
