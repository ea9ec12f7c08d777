use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::RunContext;
use crate::monitoring;
use crate::sandbox::{Capture, Invocation, Mount};
use crate::submission::{FileWarnings, Submission, Warning};

const REPORT_FILE: &str = "analysis_checkstyle.xml";

/// Runs checkstyle with the test's rule set and parses its XML report.
pub(super) async fn analyse(
    ctx: &RunContext,
    submission: &Submission,
    rules: &Path,
) -> Vec<FileWarnings> {
    if let Err(e) = run(ctx, submission, rules).await {
        log::error!(
            "error executing checkstyle analysis for test {}: {e}",
            submission.test_name
        );
        monitoring::inc_error("analysis");
        return Vec::new();
    }

    match parse_report(&submission.run_dir.join(REPORT_FILE)) {
        Ok(warnings) => warnings,
        Err(e) => {
            log::error!(
                "error parsing checkstyle analysis result for test {}: {e}",
                submission.test_name
            );
            monitoring::inc_error("analysis");
            Vec::new()
        }
    }
}

async fn run(ctx: &RunContext, submission: &Submission, rules: &Path) -> Result<()> {
    let run_dir = &submission.run_dir;

    let mut inv = Invocation::new(
        format!("{}-analysis-checkstyle", submission.id),
        &ctx.images.checkstyle,
        run_dir.clone(),
    );
    inv.timeout = Duration::from_secs(submission.config.analysis_timeout_s());
    inv.memory_mb = Some(submission.config.analysis_mem_mb());
    inv.mounts.push(Mount {
        host: std::fs::canonicalize(rules)?,
        container: "/checkstyle/checkstyle.xml".to_string(),
        read_only: true,
    });
    inv.stdout = Capture::File(run_dir.join(REPORT_FILE));
    inv.stderr = Capture::Buffer;
    inv.command = ["-c", "/checkstyle/checkstyle.xml", "-f", "xml", "/code"]
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

/// Maps a checkstyle report into the generic warning shape. The rule keeps
/// only the last segment of the check's class name, and the severity maps
/// onto the fixed priority table.
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
        for error in file_node
            .children()
            .filter(|c| c.tag_name().name() == "error")
        {
            let source = error.attribute("source").unwrap_or_default();
            file_warnings.warnings.push(Warning {
                rule: source.rsplit('.').next().unwrap_or_default().to_string(),
                rule_set: "checkstyle".to_string(),
                begin_line: error
                    .attribute("line")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                priority: severity_priority(error.attribute("severity").unwrap_or_default()),
                message: error.attribute("message").unwrap_or_default().to_string(),
                ..Warning::default()
            });
        }
        result.push(file_warnings);
    }
    Ok(result)
}

/// Fixed severity-to-priority table, total over the severity domain
fn severity_priority(severity: &str) -> u32 {
    match severity {
        "ignore" => 5,
        "info" => 4,
        "warning" => 3,
        "error" => 1,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<checkstyle version="8.18">
  <file name="uploads/Main.java">
    <error line="1" severity="error" message="Missing a Javadoc comment." source="com.puppycrawl.tools.checkstyle.checks.javadoc.JavadocMethodCheck"/>
    <error line="7" severity="warning" message="Line is longer than 100 characters." source="com.puppycrawl.tools.checkstyle.checks.sizes.LineLengthCheck"/>
  </file>
</checkstyle>"#;

    #[test]
    fn maps_checkstyle_errors_into_the_generic_shape() {
        let warnings = parse_warnings(REPORT).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].file, "uploads/Main.java");
        assert_eq!(warnings[0].warnings.len(), 2);

        let first = &warnings[0].warnings[0];
        assert_eq!(first.rule, "JavadocMethodCheck");
        assert_eq!(first.rule_set, "checkstyle");
        assert_eq!(first.begin_line, 1);
        assert_eq!(first.priority, 1);
        assert_eq!(first.message, "Missing a Javadoc comment.");

        assert_eq!(warnings[0].warnings[1].priority, 3);
    }

    #[test]
    fn priority_mapping_is_total() {
        assert_eq!(severity_priority("ignore"), 5);
        assert_eq!(severity_priority("info"), 4);
        assert_eq!(severity_priority("warning"), 3);
        assert_eq!(severity_priority("error"), 1);
        assert_eq!(severity_priority("fatal"), 3);
        assert_eq!(severity_priority(""), 3);
    }
}
