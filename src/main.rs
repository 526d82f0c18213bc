use std::sync::Arc;

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};
use clap::Parser;
use operator::{
    self,
    config::OperatorConfig,
    search_controller::{State, run},
    telemetry,
};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(OperatorConfig::parse());
    telemetry::init(config.log_format);

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = run(state.clone(), config.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(config.probe_address.as_str())?
    .shutdown_timeout(5);

    // Both implement graceful shutdown, so poll until both are done
    let (controller_result, server_result) = tokio::join!(controller, server.run());
    controller_result?;
    server_result?;
    Ok(())
}
