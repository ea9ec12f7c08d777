use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::config::RunContext;
use crate::languages;
use crate::monitoring;
use crate::scheduler::Scheduler;
use crate::submission::{CompileJob, Submission, TestJob, TestResult};

// Test-directory overlays staged into the run dir before compilation.
// Resources overwrite user files, template files do not.
const RESOURCES_DIR: &str = "resources";
const TEMPLATE_DIR: &str = "template";

/// Compile-stage handler: stage overlays, fan the sidecar jobs out, compile,
/// and either short-circuit with a non-compiled result or enqueue the test
/// stage.
pub async fn handle(job: CompileJob, ctx: Arc<RunContext>, scheduler: Arc<Scheduler>) {
    let CompileJob {
        submission,
        reply_test,
        analysis,
        metric,
    } = job;

    log::debug!(
        "compiling submission {} for test {}",
        submission.id,
        submission.test_name
    );

    if let Err(e) = copy_overlays(&submission) {
        log::error!("could not copy resources for {}: {e}", submission.id);
        monitoring::inc_error("compile");
    }

    // analysis and metrics work on the sources, so they start right away
    if let Some(analysis_job) = analysis {
        scheduler.analysis.push(analysis_job);
    }
    if let Some(metric_job) = metric {
        scheduler.metric.push(metric_job);
    }

    let started = Instant::now();
    let outcome = languages::compile(&ctx, &submission).await;
    log::debug!(
        "compilation of {} took {:?}",
        submission.id,
        started.elapsed()
    );

    match outcome {
        Err(e) => {
            monitoring::COMPILE_ERROR_TOTAL.inc();
            let result = TestResult::not_compiled(&submission.id, e.to_string());
            if reply_test.send(result).is_err() {
                log::warn!("compile reply for {} dropped, receiver gone", submission.id);
            }
        }
        Ok(()) => scheduler.test.push(TestJob {
            submission,
            reply_test,
        }),
    }
}

/// Stages the test's resource and template overlays onto the run dir.
fn copy_overlays(submission: &Submission) -> Result<()> {
    copy_tree(
        &submission.test_dir.join(RESOURCES_DIR),
        &submission.run_dir,
        true,
    )?;
    copy_tree(
        &submission.test_dir.join(TEMPLATE_DIR),
        &submission.run_dir,
        false,
    )?;
    Ok(())
}

/// Recursively copies `source` onto `destination`. Existing files survive
/// unless `overwrite` is set; a missing source is not an error.
fn copy_tree(source: &Path, destination: &Path, overwrite: bool) -> Result<()> {
    let Ok(metadata) = std::fs::metadata(source) else {
        return Ok(());
    };

    if metadata.is_dir() {
        std::fs::create_dir_all(destination)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(
                &entry.path(),
                &destination.join(entry.file_name()),
                overwrite,
            )?;
        }
    } else {
        if !overwrite && destination.exists() {
            return Ok(());
        }
        std::fs::copy(source, destination)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_overwrite_user_files() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Main.java"), "resource version").unwrap();
        std::fs::write(dest.path().join("Main.java"), "user version").unwrap();

        copy_tree(source.path(), dest.path(), true).unwrap();

        let content = std::fs::read_to_string(dest.path().join("Main.java")).unwrap();
        assert_eq!(content, "resource version");
    }

    #[test]
    fn templates_keep_user_files() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Main.java"), "template version").unwrap();
        std::fs::write(source.path().join("Helper.java"), "helper").unwrap();
        std::fs::write(dest.path().join("Main.java"), "user version").unwrap();

        copy_tree(source.path(), dest.path(), false).unwrap();

        let main = std::fs::read_to_string(dest.path().join("Main.java")).unwrap();
        assert_eq!(main, "user version");
        let helper = std::fs::read_to_string(dest.path().join("Helper.java")).unwrap();
        assert_eq!(helper, "helper");
    }

    #[test]
    fn nested_directories_are_copied() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("data/deep")).unwrap();
        std::fs::write(source.path().join("data/deep/input.txt"), "42").unwrap();

        copy_tree(source.path(), dest.path(), true).unwrap();

        let content = std::fs::read_to_string(dest.path().join("data/deep/input.txt")).unwrap();
        assert_eq!(content, "42");
    }

    #[test]
    fn missing_source_is_not_an_error() {
        let dest = tempfile::tempdir().unwrap();
        copy_tree(Path::new("/nonexistent/overlay"), dest.path(), true).unwrap();
    }
}
