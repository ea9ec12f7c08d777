use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::TestConfig;

/// One client request as it travels through the pipeline.
///
/// The record is strictly a tree: the immutable core is shared by the stage
/// messages, each of which owns the single-shot reply sender for its stage.
#[derive(Debug)]
pub struct Submission {
    /// Unique id, also the prefix of every sandbox instance name
    pub id: String,
    /// Workspace owned exclusively by this submission
    pub run_dir: PathBuf,
    /// Read-only directory of the requested test
    pub test_dir: PathBuf,
    /// Test identifier chosen by the client
    pub test_name: String,
    pub config: TestConfig,
}

impl Submission {
    /// Directory under the run dir that received the uploaded files
    pub fn uploads_dir(&self) -> PathBuf {
        self.run_dir.join(&self.config.uploads_dir)
    }
}

/// Message consumed by the compile stage. Carries the sidecar jobs so the
/// stage can fan them out before compilation starts.
pub struct CompileJob {
    pub submission: Arc<Submission>,
    pub reply_test: oneshot::Sender<TestResult>,
    pub analysis: Option<AnalysisJob>,
    pub metric: Option<MetricJob>,
}

pub struct TestJob {
    pub submission: Arc<Submission>,
    pub reply_test: oneshot::Sender<TestResult>,
}

pub struct AnalysisJob {
    pub submission: Arc<Submission>,
    pub reply: oneshot::Sender<Vec<FileWarnings>>,
}

pub struct MetricJob {
    pub submission: Arc<Submission>,
    pub reply: oneshot::Sender<Vec<ClocResult>>,
}

/// Outcome of one executed test case
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TestCase {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expected: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Result of executing a test suite on a submission
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TestResult {
    pub id: String,
    pub compiled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compile_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_error: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub tests_executed: usize,
    #[serde(default)]
    pub tests_failed: usize,
    #[serde(default)]
    pub missing_files: Vec<String>,
    #[serde(default)]
    pub illegal_files: Vec<String>,
}

impl TestResult {
    pub fn not_compiled(id: &str, compile_error: String) -> Self {
        Self {
            id: id.to_string(),
            compiled: false,
            compile_error,
            ..Self::default()
        }
    }

    pub fn missing_files(id: &str, files: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            compiled: false,
            missing_files: files,
            ..Self::default()
        }
    }

    pub fn illegal_files(id: &str, files: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            compiled: false,
            illegal_files: files,
            ..Self::default()
        }
    }

    /// A tool-level failure in an otherwise compiled submission
    pub fn internal_error(submission: &Submission, message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("{message} (test: {})", submission.test_name);
        crate::monitoring::inc_error("test");
        Self {
            id: submission.id.clone(),
            compiled: true,
            internal_error: message,
            ..Self::default()
        }
    }
}

/// A single static-analysis finding
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Warning {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_set: String,
    #[serde(default)]
    pub begin_line: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info_url: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Findings of the analysis stage, grouped per file. The file path is
/// normalized relative to the uploads sub-directory before it is returned.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FileWarnings {
    pub file: String,
    pub warnings: Vec<Warning>,
}

/// Line counts of one measured file
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClocResult {
    pub name: String,
    pub comments_number: u32,
    pub loc_number: u32,
}

/// The complete response document for one submission
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct RteResult {
    pub test_result: TestResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_warnings: Option<Vec<FileWarnings>>,
    #[serde(default)]
    pub cloc_result: Vec<ClocResult>,
}
