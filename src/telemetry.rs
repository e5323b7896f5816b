use std::env;

use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_COLLECTOR: &str = "http://jaeger:14268/api/traces";

pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    // The isahc collector client would otherwise route spans through any
    // configured proxy.
    env::remove_var("http_proxy");
    env::remove_var("https_proxy");
    env::remove_var("HTTP_PROXY");
    env::remove_var("HTTPS_PROXY");

    global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    let endpoint =
        env::var("JAEGER_ENDPOINT").unwrap_or_else(|_| DEFAULT_COLLECTOR.to_string());

    let tracer = opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint(endpoint)
        .with_service_name("imgq")
        .with_isahc() // requires `isahc_collector_client` feature
        .with_timeout(std::time::Duration::from_secs(2))
        .install_batch(opentelemetry::runtime::Tokio)?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
