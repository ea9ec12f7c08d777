use std::path::Path;
use std::sync::Arc;

use actix_web::http::Method;
use actix_web::{App, test, web};

use rte::config::{Images, RunContext};
use rte::routes::{list_tests_handler, post_test_handler, preflight};
use rte::scheduler::Scheduler;
use rte::submission::RteResult;

const BOUNDARY: &str = "------------------------d74496d66958873e";

// Helper to build a multipart/form-data body by hand
fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(content.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn content_type() -> (&'static str, String) {
    ("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
}

fn test_context(testdata_dir: &Path, testrun_dir: &Path, api_key: &str) -> Arc<RunContext> {
    Arc::new(RunContext {
        base_dir: testdata_dir.parent().unwrap().to_path_buf(),
        testdata_dir: testdata_dir.to_path_buf(),
        testrun_dir: testrun_dir.to_path_buf(),
        tools_dir: testdata_dir.join("_tools"),
        api_key: api_key.to_string(),
        clean_testruns: false,
        images: Images {
            java: "eclipse-temurin:21".to_string(),
            c: "silkeh/clang:18".to_string(),
            fsharp: "mcr.microsoft.com/dotnet/sdk:8.0".to_string(),
            python: "python:3-slim".to_string(),
            matlab: "matlab".to_string(),
            checkstyle: "checkstyle/checkstyle".to_string(),
            pmd: "pmdcode/pmd".to_string(),
            cloc: "aldanial/cloc".to_string(),
        },
    })
}

macro_rules! init_app {
    ($ctx:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::from($ctx))
                .app_data(web::Data::from(Arc::new(Scheduler::new())))
                .service(post_test_handler)
                .service(list_tests_handler)
                .route("/test", web::method(Method::OPTIONS).to(preflight)),
        )
        .await
    };
}

/// A test tree with one configured test requiring Main.java
fn write_test_tree(testdata_dir: &Path) {
    let test_dir = testdata_dir.join("simple");
    std::fs::create_dir_all(&test_dir).unwrap();
    std::fs::write(
        test_dir.join("config.json"),
        r#"{
            "compiler": "java",
            "test_type": "io-diff",
            "main": "Main",
            "required_files": ["Main.java"],
            "allowed_files": ["[A-Za-z]+\\.java"],
            "uploads_dir": "uploads"
        }"#,
    )
    .unwrap();
}

#[actix_web::test]
async fn missing_test_parameter_is_a_bad_request() {
    let base = tempfile::tempdir().unwrap();
    let ctx = test_context(&base.path().join("tests"), &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let body = multipart_body(&[("code", None, "x"), ("filename", None, "Main.java")]);
    let req = test::TestRequest::post()
        .uri("/test")
        .insert_header(content_type())
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn unknown_test_is_not_found() {
    let base = tempfile::tempdir().unwrap();
    let testdata = base.path().join("tests");
    write_test_tree(&testdata);
    let ctx = test_context(&testdata, &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let body = multipart_body(&[("test", None, "no-such-test")]);
    let req = test::TestRequest::post()
        .uri("/test")
        .insert_header(content_type())
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn escaping_test_references_are_rejected() {
    let base = tempfile::tempdir().unwrap();
    let testdata = base.path().join("tests");
    write_test_tree(&testdata);
    let ctx = test_context(&testdata, &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let body = multipart_body(&[("test", None, "../tests/simple")]);
    let req = test::TestRequest::post()
        .uri("/test")
        .insert_header(content_type())
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn wrong_api_key_is_forbidden() {
    let base = tempfile::tempdir().unwrap();
    let testdata = base.path().join("tests");
    write_test_tree(&testdata);
    let ctx = test_context(&testdata, &base.path().join("runs"), "secret");
    let app = init_app!(ctx);

    let req = test::TestRequest::get().uri("/listtests").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::get()
        .uri("/listtests")
        .insert_header(("ApiKey", "wrong"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::get()
        .uri("/listtests")
        .insert_header(("ApiKey", "secret"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn missing_required_file_short_circuits_without_compiling() {
    let base = tempfile::tempdir().unwrap();
    let testdata = base.path().join("tests");
    write_test_tree(&testdata);
    let ctx = test_context(&testdata, &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let body = multipart_body(&[
        ("test", None, "simple"),
        ("numfiles", None, "1"),
        ("file0", Some("Other.java"), "class Other {}"),
    ]);
    let req = test::TestRequest::post()
        .uri("/test")
        .insert_header(content_type())
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let result: RteResult = test::read_body_json(resp).await;
    assert!(!result.test_result.compiled);
    assert_eq!(result.test_result.missing_files, vec!["Main.java"]);
    assert!(result.test_result.illegal_files.is_empty());
}

#[actix_web::test]
async fn files_outside_the_allowlist_short_circuit() {
    let base = tempfile::tempdir().unwrap();
    let testdata = base.path().join("tests");
    write_test_tree(&testdata);
    let ctx = test_context(&testdata, &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let body = multipart_body(&[
        ("test", None, "simple"),
        ("numfiles", None, "2"),
        ("file0", Some("Main.java"), "class Main {}"),
        ("file1", Some("exploit.sh"), "#!/bin/sh"),
    ]);
    let req = test::TestRequest::post()
        .uri("/test")
        .insert_header(content_type())
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let result: RteResult = test::read_body_json(resp).await;
    assert!(!result.test_result.compiled);
    assert_eq!(result.test_result.illegal_files, vec!["exploit.sh"]);
}

#[actix_web::test]
async fn listtests_reports_configured_tests() {
    let base = tempfile::tempdir().unwrap();
    let testdata = base.path().join("tests");
    write_test_tree(&testdata);
    std::fs::create_dir_all(testdata.join("course/week1")).unwrap();
    std::fs::write(
        testdata.join("course/week1/config.json"),
        r#"{"compiler": "c", "test_type": "io-diff"}"#,
    )
    .unwrap();
    let ctx = test_context(&testdata, &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let req = test::TestRequest::get().uri("/listtests").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], true);
    let tests: Vec<String> = body["tests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect();
    assert_eq!(tests, vec!["course/week1", "simple"]);
}

#[actix_web::test]
async fn options_preflight_is_permitted() {
    let base = tempfile::tempdir().unwrap();
    let ctx = test_context(&base.path().join("tests"), &base.path().join("runs"), "");
    let app = init_app!(ctx);

    let req = test::TestRequest::with_uri("/test")
        .method(Method::OPTIONS)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}
