use std::sync::Arc;

use actix_web::{
    get, middleware,
    web::Data,
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use prometheus::{Encoder, TextEncoder};

use kubevip_ipam::manager::PoolRegistry;
use kubevip_trace::init::{prepare_tracing, TraceConfig};

use crate::config::Config;
use crate::context::State;

use super::reconciler::service_watcher::{self, LoadBalancerContext};

pub fn start(config: Config, trace: TraceConfig) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(config, trace));
}

#[tracing::instrument(skip_all)]
async fn run(config: Config, trace_config: TraceConfig) {
    prepare_tracing(trace_config).await;

    // Initiatilize Kubernetes controller state
    let state = State::new("kubevip-cloud-provider");

    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind(format!("0.0.0.0:{}", config.http_port))
    .unwrap()
    .shutdown_timeout(5);

    let registry = Arc::new(PoolRegistry::new());

    if config.enable_load_balancer_class {
        tracing::info!(
            config_map = config.config_map,
            namespace = config.namespace,
            class = config.load_balancer_class,
            "Start Service load balancer class controller"
        );
        let service_state = state.clone();
        let component = LoadBalancerContext {
            registry: registry.clone(),
            config_map: config.config_map.clone(),
            config_namespace: config.namespace.clone(),
            load_balancer_class: config.load_balancer_class.clone(),
        };
        let interval = config.requeue_interval;
        tokio::spawn(async move {
            service_watcher::run(service_state, interval, component).await;
        });
    } else {
        tracing::warn!(
            "The load balancer class controller is disabled, serving diagnostics only"
        );
    }

    server.run().await.unwrap()
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
