use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use actix_multipart::{Multipart, MultipartError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use futures_util::StreamExt as _;
use regex::Regex;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::analysis::{CHECKSTYLE_RULES, PMD_RULES};
use crate::config::{RunContext, TestConfig};
use crate::monitoring::{self, report_error};
use crate::scheduler::Scheduler;
use crate::submission::{
    AnalysisJob, CompileJob, MetricJob, RteResult, Submission, TestResult,
};

#[derive(Serialize)]
struct ListResult {
    success: bool,
    tests: Vec<String>,
}

/// One uploaded file part
struct UploadedFile {
    filename: String,
    content: Vec<u8>,
}

/// The parsed multipart form of a submission request
#[derive(Default)]
struct TestUpload {
    fields: HashMap<String, String>,
    files: HashMap<String, UploadedFile>,
}

impl TestUpload {
    async fn read_from(mut payload: Multipart) -> Result<Self, MultipartError> {
        let mut upload = TestUpload::default();
        while let Some(item) = payload.next().await {
            let mut field = item?;
            let name = field.name().to_string();
            let filename = field
                .content_disposition()
                .get_filename()
                .map(str::to_string);
            let mut content = Vec::new();
            while let Some(chunk) = field.next().await {
                content.extend_from_slice(&chunk?);
            }
            match filename {
                Some(filename) => {
                    upload.files.insert(name, UploadedFile { filename, content });
                }
                None => {
                    upload
                        .fields
                        .insert(name, String::from_utf8_lossy(&content).into_owned());
                }
            }
        }
        Ok(upload)
    }

    /// Field value, whether the client sent it as a plain field or a part
    fn value(&self, key: &str) -> String {
        if let Some(value) = self.fields.get(key) {
            return value.clone();
        }
        if let Some(file) = self.files.get(key) {
            return String::from_utf8_lossy(&file.content).into_owned();
        }
        String::new()
    }
}

/// Accepts a submission, pushes it into the pipeline and assembles the
/// final document from the three reply channels.
#[post("/test")]
pub async fn post_test_handler(
    req: HttpRequest,
    payload: Multipart,
    ctx: web::Data<RunContext>,
    scheduler: web::Data<Scheduler>,
) -> impl Responder {
    monitoring::ACCESS_TOTAL.inc();

    if let Some(denied) = check_api_key(&req, &ctx.api_key, "upload") {
        return denied;
    }

    let upload = match TestUpload::read_from(payload).await {
        Ok(upload) => upload,
        Err(e) => {
            report_error("upload", format!("Error reading upload: {e}"));
            return HttpResponse::BadRequest().body(e.to_string());
        }
    };

    let test_ref = upload.value("test");
    if test_ref.is_empty() {
        report_error("upload", "Missing parameter 'test'");
        return HttpResponse::BadRequest().body("Parameter 'test' required!");
    }
    let Some(test_ref) = clean_test_ref(&test_ref) else {
        report_error("upload", format!("Test not found: {test_ref}"));
        return HttpResponse::NotFound().body("Test not found!\n");
    };

    let test_dir = ctx.testdata_dir.join(&test_ref);
    let test_name = test_ref.to_string_lossy().into_owned();
    if !test_dir.is_dir() {
        report_error("upload", format!("Test not found: {test_name}"));
        return HttpResponse::NotFound().body("Test not found!\n");
    }

    let config_path = test_dir.join("config.json");
    let config_file = match std::fs::File::open(&config_path) {
        Ok(file) => file,
        Err(_) => {
            report_error("upload", format!("Test is missing config file: {test_name}"));
            return HttpResponse::NotFound()
                .body(format!("Config for test not found: {}\n", test_dir.display()));
        }
    };
    let config: TestConfig = match serde_json::from_reader(std::io::BufReader::new(config_file)) {
        Ok(config) => config,
        Err(e) => {
            report_error("upload", format!("Error in test configuration: {test_name} ({e})"));
            return HttpResponse::InternalServerError().body(format!(
                "Error reading test configuration: {} ({e})\n",
                test_dir.display()
            ));
        }
    };

    let id = Uuid::new_v4().to_string();
    let run_dir = ctx.testrun_dir.join(&id);
    if let Err(e) = std::fs::create_dir_all(&run_dir) {
        report_error("upload", format!("Could not create run folder: {}", run_dir.display()));
        return HttpResponse::InternalServerError().body(e.to_string());
    }
    let uploads_dir = run_dir.join(&config.uploads_dir);
    if let Err(e) = std::fs::create_dir_all(&uploads_dir) {
        report_error(
            "upload",
            format!("Could not create upload folder {}: {e}", uploads_dir.display()),
        );
        return HttpResponse::InternalServerError().body(e.to_string());
    }

    let numfiles = upload.value("numfiles");
    if !numfiles.is_empty() {
        let numfiles: usize = match numfiles.parse() {
            Ok(n) => n,
            Err(e) => {
                report_error("upload", format!("Error parsing number of files: {e}"));
                return HttpResponse::BadRequest().body(e.to_string());
            }
        };

        let mut names = Vec::with_capacity(numfiles);
        for i in 0..numfiles {
            match upload.files.get(&format!("file{i}")) {
                Some(file) => names.push(file.filename.clone()),
                None => {
                    report_error("upload", format!("Missing file{i} in request"));
                    return HttpResponse::InternalServerError()
                        .body(format!("Error reading file{i} from request"));
                }
            }
        }

        if !config.required_files.is_empty() {
            let missing = find_missing(&config.required_files, &names);
            if !missing.is_empty() {
                return test_result_response(TestResult::missing_files(&id, missing));
            }
        }
        if !config.allowed_files.is_empty() {
            let allowlist = match compile_allowlist(&config.allowed_files) {
                Ok(allowlist) => allowlist,
                Err(e) => {
                    report_error(
                        "matching",
                        format!("Error parsing allowed-files pattern in test {test_name}: {e}"),
                    );
                    return HttpResponse::InternalServerError().body(e.to_string());
                }
            };
            let illegal = find_illegal(&allowlist, &names);
            if !illegal.is_empty() {
                for file in &illegal {
                    log::info!("file {file} not allowed for test {test_name}");
                }
                return test_result_response(TestResult::illegal_files(&id, illegal));
            }
        }

        for i in 0..numfiles {
            let file = &upload.files[&format!("file{i}")];
            let Some(filename) = sanitize_filename(&file.filename) else {
                report_error("upload", format!("Illegal upload file name: {}", file.filename));
                return HttpResponse::BadRequest().body("Illegal file name");
            };
            let target = uploads_dir.join(filename);
            if let Err(e) = std::fs::write(&target, &file.content) {
                report_error(
                    "upload",
                    format!("Could not open target file for writing: {}", target.display()),
                );
                return HttpResponse::InternalServerError().body(e.to_string());
            }
        }
    } else {
        let code = upload.value("code");
        let filename = upload.value("filename");
        let Some(filename) = sanitize_filename(&filename) else {
            report_error("upload", "Missing or illegal parameter 'filename'");
            return HttpResponse::BadRequest().body("Parameter 'filename' required!");
        };
        let target = uploads_dir.join(filename);
        if let Err(e) = std::fs::write(&target, code.as_bytes()) {
            report_error(
                "upload",
                format!("Could not open target file for writing: {}", target.display()),
            );
            return HttpResponse::InternalServerError().body(e.to_string());
        }
    }

    let submission = Arc::new(Submission {
        id: id.clone(),
        run_dir,
        test_dir,
        test_name,
        config,
    });

    let (test_tx, test_rx) = oneshot::channel();
    let (warnings_tx, warnings_rx) = oneshot::channel();
    let (metric_tx, metric_rx) = oneshot::channel();

    // the analysis sink only attaches when a rule file exists; otherwise
    // the dropped sender reads as an empty, closed channel
    let has_rules = submission.test_dir.join(PMD_RULES).is_file()
        || submission.test_dir.join(CHECKSTYLE_RULES).is_file();
    let analysis = has_rules.then(|| AnalysisJob {
        submission: submission.clone(),
        reply: warnings_tx,
    });
    let metric = Some(MetricJob {
        submission: submission.clone(),
        reply: metric_tx,
    });

    scheduler.compile.push(CompileJob {
        submission,
        reply_test: test_tx,
        analysis,
        metric,
    });

    // fixed read order; arrival order does not matter since each reply has
    // its own channel
    let file_warnings = warnings_rx.await.ok();
    let test_result = test_rx.await.unwrap_or_else(|_| {
        report_error("test", format!("Test reply for {id} was dropped"));
        TestResult {
            id: id.clone(),
            compiled: false,
            internal_error: "Internal error during test execution".to_string(),
            ..TestResult::default()
        }
    });
    let cloc_result = metric_rx.await.unwrap_or_default();

    HttpResponse::Ok().json(RteResult {
        test_result,
        file_warnings,
        cloc_result,
    })
}

/// Lists every test that carries a config descriptor.
#[get("/listtests")]
pub async fn list_tests_handler(req: HttpRequest, ctx: web::Data<RunContext>) -> impl Responder {
    if let Some(denied) = check_api_key(&req, &ctx.api_key, "listing") {
        return denied;
    }

    match scan_tests(&ctx.testdata_dir) {
        Ok(tests) => HttpResponse::Ok().json(ListResult {
            success: true,
            tests,
        }),
        Err(e) => {
            report_error("listing", format!("Could not find tests: {e}"));
            HttpResponse::Ok().json(ListResult {
                success: false,
                tests: Vec::new(),
            })
        }
    }
}

/// Permissive CORS preflight
pub async fn preflight() -> impl Responder {
    HttpResponse::Ok()
}

fn test_result_response(result: TestResult) -> HttpResponse {
    HttpResponse::Ok().json(RteResult {
        test_result: result,
        ..RteResult::default()
    })
}

fn check_api_key(req: &HttpRequest, api_key: &str, phase: &str) -> Option<HttpResponse> {
    if api_key.is_empty() {
        return None;
    }
    let sent = req
        .headers()
        .get("ApiKey")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if sent != api_key {
        report_error(phase, "Invalid or missing ApiKey");
        return Some(HttpResponse::Forbidden().finish());
    }
    None
}

/// Cleans a client-supplied test reference into a safe relative path.
/// Nested test names are fine; anything escaping the test data tree is not.
fn clean_test_ref(raw: &str) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!cleaned.as_os_str().is_empty()).then_some(cleaned)
}

/// Strips an uploaded file name down to its final component
fn sanitize_filename(raw: &str) -> Option<&str> {
    let name = Path::new(raw).file_name()?.to_str()?;
    (!name.is_empty()).then_some(name)
}

/// Required files that were not uploaded, in declaration order
fn find_missing(required: &[String], uploaded: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|required| !uploaded.contains(required))
        .cloned()
        .collect()
}

fn compile_allowlist(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|pattern| Regex::new(pattern)).collect()
}

/// Uploaded files that match none of the allowlist patterns
fn find_illegal(allowlist: &[Regex], uploaded: &[String]) -> Vec<String> {
    uploaded
        .iter()
        .filter(|name| !allowlist.iter().any(|pattern| pattern.is_match(name)))
        .cloned()
        .collect()
}

/// Walks the test data tree and returns the name of every test directory
/// that holds a config descriptor.
pub fn scan_tests(testdata_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut tests = Vec::new();
    for entry in walkdir::WalkDir::new(testdata_dir).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == "config.json" {
            if let Some(parent) = entry.path().parent() {
                let rel = parent.strip_prefix(testdata_dir)?;
                tests.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    tests.sort();
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refs_are_cleaned() {
        assert_eq!(clean_test_ref("gdp21/05/2"), Some(PathBuf::from("gdp21/05/2")));
        assert_eq!(clean_test_ref("./simple"), Some(PathBuf::from("simple")));
        assert_eq!(clean_test_ref("../escape"), None);
        assert_eq!(clean_test_ref("/absolute"), None);
        assert_eq!(clean_test_ref(""), None);
        assert_eq!(clean_test_ref("a/../../b"), None);
    }

    #[test]
    fn filenames_lose_their_directories() {
        assert_eq!(sanitize_filename("Main.java"), Some("Main.java"));
        assert_eq!(sanitize_filename("dir/Main.java"), Some("Main.java"));
        assert_eq!(sanitize_filename("../../etc/passwd"), Some("passwd"));
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[test]
    fn missing_files_are_reported_in_order() {
        let required = vec!["Main.java".to_string(), "Util.java".to_string()];
        let uploaded = vec!["Util.java".to_string(), "Other.java".to_string()];
        assert_eq!(find_missing(&required, &uploaded), vec!["Main.java"]);
        assert!(find_missing(&required, &required).is_empty());
    }

    #[test]
    fn files_outside_the_allowlist_are_illegal() {
        let allowlist = compile_allowlist(&[r".*\.java".to_string()]).unwrap();
        let uploaded = vec!["Main.java".to_string(), "exploit.sh".to_string()];
        assert_eq!(find_illegal(&allowlist, &uploaded), vec!["exploit.sh"]);
    }

    #[test]
    fn broken_allowlist_patterns_are_rejected() {
        assert!(compile_allowlist(&["(".to_string()]).is_err());
    }

    #[test]
    fn scan_finds_tests_with_config_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("gdp21/05/2")).unwrap();
        std::fs::create_dir_all(dir.path().join("simple")).unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("gdp21/05/2/config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("simple/config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("broken/readme.txt"), "").unwrap();

        let tests = scan_tests(dir.path()).unwrap();
        assert_eq!(tests, vec!["gdp21/05/2", "simple"]);
    }
}
