use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, Responder, dev::Server, http::Method, middleware, web};

use crate::config::RunContext;
use crate::monitoring;
use crate::routes::{list_tests_handler, post_test_handler, preflight};
use crate::scheduler::Scheduler;

pub fn build_server(
    host: &str,
    port: u16,
    context_path: &str,
    ctx: Arc<RunContext>,
    scheduler: Arc<Scheduler>,
) -> std::io::Result<Server> {
    let ctx = web::Data::from(ctx);
    let scheduler = web::Data::from(scheduler); // Construct directly from Arc
    let prefix = context_path.trim_end_matches('/').to_string();

    let server = HttpServer::new(move || {
        let prefix = prefix.clone();
        App::new()
            .app_data(ctx.clone())
            .app_data(scheduler.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::DefaultHeaders::new().add(("Access-Control-Allow-Origin", "*")))
            .configure(move |cfg| {
                if prefix.is_empty() {
                    register(cfg);
                } else {
                    cfg.service(web::scope(&prefix).configure(register));
                }
            })
    })
    .bind((host.to_string(), port))?
    .run();

    Ok(server)
}

fn register(cfg: &mut web::ServiceConfig) {
    cfg.service(post_test_handler)
        .service(list_tests_handler)
        .route("/test", web::method(Method::OPTIONS).to(preflight))
        .route("/listtests", web::method(Method::OPTIONS).to(preflight));
}

/// Separate listener for Prometheus scraping
pub fn build_metrics_server(address: &str) -> std::io::Result<Server> {
    let server = HttpServer::new(|| App::new().route("/metrics", web::get().to(metrics_handler)))
        .bind(address)?
        .run();

    Ok(server)
}

async fn metrics_handler() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(monitoring::gather())
}
