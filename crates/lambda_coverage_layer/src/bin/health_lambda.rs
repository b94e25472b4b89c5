use std::sync::Arc;

use lambda_coverage_layer::adapters::s3_store::S3ObjectStore;
use lambda_coverage_layer::handlers::health::health_handler;
use lambda_coverage_layer::runtime::invocation::CoverageRuntime;
use lambda_coverage_layer::telemetry;
use lambda_runtime::{service_fn, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    telemetry::init_logging();

    let store = S3ObjectStore::from_env().await;
    let runtime = CoverageRuntime::with_store(Arc::new(store));

    let handler = service_fn(move |event| health_handler(runtime.clone(), event));
    lambda_runtime::run(handler).await
}
