use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "rte", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Hostname the server should bind to
    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: String,

    /// Port the server should listen on
    #[arg(long = "port", default_value_t = 8080)]
    pub port: u16,

    /// Address the server should expose Prometheus metrics on
    #[arg(long = "metricson", default_value = "0.0.0.0:3003")]
    pub metrics_address: String,

    /// The base directory (tests, runs, ...)
    #[arg(long = "basedir", default_value = ".")]
    pub base_dir: String,

    /// A prefix that is used for all URLs on the server
    #[arg(long = "context-path", default_value = "")]
    pub context_path: String,

    /// Turn on debug logging
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,

    /// Test the solutions stored in the test directory, then exit
    #[arg(long = "test-solution", default_value_t = false)]
    pub test_solution: bool,

    /// Test name of a specific solution to test (with --test-solution)
    #[arg(long = "test-name", default_value = "")]
    pub test_name: String,

    /// Image to use for Java submissions
    #[arg(long = "image-java", default_value = "eclipse-temurin:21")]
    pub image_java: String,

    /// Image to use for C submissions
    #[arg(long = "image-c", default_value = "silkeh/clang:18")]
    pub image_c: String,

    /// Image to use for F# submissions
    #[arg(long = "image-fsharp", default_value = "mcr.microsoft.com/dotnet/sdk:8.0")]
    pub image_fsharp: String,

    /// Image to use for Python submissions
    #[arg(long = "image-python", default_value = "python:3-slim")]
    pub image_python: String,

    /// Image to use for Matlab submissions
    #[arg(long = "image-matlab", default_value = "matlab")]
    pub image_matlab: String,

    /// Image to use for checkstyle analysis
    #[arg(long = "image-checkstyle", default_value = "checkstyle/checkstyle")]
    pub image_checkstyle: String,

    /// Image to use for PMD analysis
    #[arg(long = "image-pmd", default_value = "pmdcode/pmd")]
    pub image_pmd: String,

    /// Image to use for cloc metrics
    #[arg(long = "image-cloc", default_value = "aldanial/cloc")]
    pub image_cloc: String,

    /// Folder where tests are stored; relative paths are resolved against the base dir
    #[arg(long = "testdata-folder", default_value = "tests")]
    pub testdata_folder: String,

    /// Folder where individual test runs are stored; relative paths are resolved against the base dir
    #[arg(long = "testrun-folder", default_value = "runs")]
    pub testrun_folder: String,

    /// Folder holding external compare tools; relative paths are resolved against the testdata folder
    #[arg(long = "tools-folder", default_value = "_tools")]
    pub tools_folder: String,

    /// Remove run folders after executing tests
    #[arg(long = "clean-testruns", default_value_t = false)]
    pub clean_testruns: bool,
}

impl CliArgs {
    /// Resolve directories and secrets into the runtime context
    pub fn to_context(&self) -> std::io::Result<RunContext> {
        let base_dir = std::fs::canonicalize(&self.base_dir)?;
        let testdata_dir = resolve(&base_dir, &self.testdata_folder);
        let testrun_dir = resolve(&base_dir, &self.testrun_folder);
        let tools_dir = resolve(&testdata_dir, &self.tools_folder);

        Ok(RunContext {
            base_dir,
            testdata_dir,
            testrun_dir,
            tools_dir,
            api_key: std::env::var("RTE_API_KEY").unwrap_or_default(),
            clean_testruns: self.clean_testruns,
            images: Images {
                java: self.image_java.clone(),
                c: self.image_c.clone(),
                fsharp: self.image_fsharp.clone(),
                python: self.image_python.clone(),
                matlab: self.image_matlab.clone(),
                checkstyle: self.image_checkstyle.clone(),
                pmd: self.image_pmd.clone(),
                cloc: self.image_cloc.clone(),
            },
        })
    }
}

fn resolve(base: &Path, folder: &str) -> PathBuf {
    let path = Path::new(folder);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Sandbox image tags, one per language or tool
#[derive(Debug, Clone)]
pub struct Images {
    pub java: String,
    pub c: String,
    pub fsharp: String,
    pub python: String,
    pub matlab: String,
    pub checkstyle: String,
    pub pmd: String,
    pub cloc: String,
}

/// Process-wide runtime context, resolved once at startup and shared by
/// every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub base_dir: PathBuf,
    pub testdata_dir: PathBuf,
    pub testrun_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub api_key: String,
    pub clean_testruns: bool,
    pub images: Images,
}

// Limit defaults applied when the test descriptor leaves them out.
const DEFAULT_TIMEOUT_S: u64 = 10;
const DEFAULT_MEM_MB: u64 = 100;
const DEFAULT_ANALYSIS_TIMEOUT_S: u64 = 20;
const DEFAULT_ANALYSIS_MEM_MB: u64 = 100;

/// Configuration of a single test, loaded from its `config.json` descriptor
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TestConfig {
    pub compiler: Compiler,
    pub test_type: TestType,
    pub main: Option<String>,
    pub timeout_s: Option<u64>,
    pub mem_mb: Option<u64>,
    pub analysis_timeout_s: Option<u64>,
    pub analysis_mem_mb: Option<u64>,
    pub compare_tool: Option<String>,
    pub compare_tool_args: Vec<String>,
    pub required_files: Vec<String>,
    pub allowed_files: Vec<String>,
    pub uploads_dir: String,
}

impl TestConfig {
    pub fn timeout_s(&self) -> u64 {
        non_zero_or(self.timeout_s, DEFAULT_TIMEOUT_S)
    }

    pub fn mem_mb(&self) -> u64 {
        non_zero_or(self.mem_mb, DEFAULT_MEM_MB)
    }

    pub fn analysis_timeout_s(&self) -> u64 {
        non_zero_or(self.analysis_timeout_s, DEFAULT_ANALYSIS_TIMEOUT_S)
    }

    pub fn analysis_mem_mb(&self) -> u64 {
        non_zero_or(self.analysis_mem_mb, DEFAULT_ANALYSIS_MEM_MB)
    }

    /// Entry-point name, where the compiler needs one
    pub fn main_name(&self) -> &str {
        self.main.as_deref().unwrap_or_default()
    }
}

fn non_zero_or(value: Option<u64>, default: u64) -> u64 {
    match value {
        Some(0) | None => default,
        Some(v) => v,
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    #[default]
    Java,
    C,
    Fsharp,
    Python,
    Matlab,
}

impl Compiler {
    pub fn name(&self) -> &'static str {
        match self {
            Compiler::Java => "java",
            Compiler::C => "c",
            Compiler::Fsharp => "fsharp",
            Compiler::Python => "python",
            Compiler::Matlab => "matlab",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TestType {
    #[default]
    IoDiff,
    Junit,
    Xunit,
    Pytest,
    Matlab,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config: TestConfig = serde_json::from_str(
            r#"{
                "compiler": "java",
                "test_type": "junit",
                "main": "Main",
                "timeout_s": 30,
                "required_files": ["Main.java"],
                "allowed_files": [".*\\.java"],
                "uploads_dir": "uploads"
            }"#,
        )
        .unwrap();
        assert_eq!(config.compiler, Compiler::Java);
        assert_eq!(config.test_type, TestType::Junit);
        assert_eq!(config.main_name(), "Main");
        assert_eq!(config.timeout_s(), 30);
        assert_eq!(config.required_files, vec!["Main.java"]);
        assert_eq!(config.uploads_dir, "uploads");
    }

    #[test]
    fn test_config_limit_defaults() {
        let config: TestConfig =
            serde_json::from_str(r#"{"compiler": "c", "test_type": "io-diff"}"#).unwrap();
        assert_eq!(config.timeout_s(), 10);
        assert_eq!(config.mem_mb(), 100);
        assert_eq!(config.analysis_timeout_s(), 20);
        assert_eq!(config.analysis_mem_mb(), 100);

        // an explicit zero falls back to the default as well
        let config: TestConfig =
            serde_json::from_str(r#"{"compiler": "c", "test_type": "io-diff", "timeout_s": 0}"#)
                .unwrap();
        assert_eq!(config.timeout_s(), 10);
    }

    #[test]
    fn test_type_names_match_descriptors() {
        for (tag, expected) in [
            ("\"io-diff\"", TestType::IoDiff),
            ("\"junit\"", TestType::Junit),
            ("\"xunit\"", TestType::Xunit),
            ("\"pytest\"", TestType::Pytest),
            ("\"matlab\"", TestType::Matlab),
        ] {
            let parsed: TestType = serde_json::from_str(tag).unwrap();
            assert_eq!(parsed, expected);
        }
    }
}
