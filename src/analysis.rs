pub mod checkstyle;
pub mod pmd;

use std::path::Path;
use std::sync::Arc;

use crate::config::RunContext;
use crate::submission::{AnalysisJob, FileWarnings, Submission};

/// Rule files recognized in a test directory. Their presence decides
/// whether the analysis stage runs at all.
pub const PMD_RULES: &str = "pmd.xml";
pub const CHECKSTYLE_RULES: &str = "checkstyle.xml";

/// Analysis-stage handler
pub async fn handle(job: AnalysisJob, ctx: Arc<RunContext>) {
    log::debug!("executing analysis for submission {}", job.submission.id);
    let warnings = analyse(&ctx, &job.submission).await;
    if job.reply.send(warnings).is_err() {
        log::warn!(
            "analysis reply for {} dropped, receiver gone",
            job.submission.id
        );
    }
}

/// Runs every analyzer whose rule file exists, concurrently, and merges the
/// findings.
async fn analyse(ctx: &RunContext, submission: &Submission) -> Vec<FileWarnings> {
    let pmd_rules = submission.test_dir.join(PMD_RULES);
    let checkstyle_rules = submission.test_dir.join(CHECKSTYLE_RULES);

    let pmd_findings = async {
        if pmd_rules.is_file() {
            pmd::analyse(ctx, submission, &pmd_rules).await
        } else {
            Vec::new()
        }
    };
    let checkstyle_findings = async {
        if checkstyle_rules.is_file() {
            checkstyle::analyse(ctx, submission, &checkstyle_rules).await
        } else {
            Vec::new()
        }
    };

    let (mut warnings, checkstyle_warnings) = tokio::join!(pmd_findings, checkstyle_findings);
    warnings.extend(checkstyle_warnings);

    normalize_paths(&mut warnings, &submission.config.uploads_dir);
    warnings
}

/// Rewrites finding paths that point into the uploads sub-directory so the
/// client sees them relative to what it uploaded.
fn normalize_paths(warnings: &mut [FileWarnings], uploads_dir: &str) {
    if uploads_dir.is_empty() {
        return;
    }
    for file_warnings in warnings {
        if let Ok(rel) = Path::new(&file_warnings.file).strip_prefix(uploads_dir) {
            file_warnings.file = rel.to_string_lossy().into_owned();
        }
    }
}
