use std::sync::Arc;

use lambda_coverage_layer::adapters::s3_store::S3ObjectStore;
use lambda_coverage_layer::handlers::combiner::{
    coverage_combiner_handler, Combiner, CombinerResponse,
};
use lambda_coverage_layer::runtime::upload::{ThreadSleeper, Uploader};
use lambda_coverage_layer::telemetry;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

async fn handle_request(
    combiner: Arc<Combiner>,
    event: LambdaEvent<Value>,
) -> Result<CombinerResponse, Error> {
    let (payload, context) = event.into_parts();
    Ok(coverage_combiner_handler(&payload, &context, &combiner))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    telemetry::init_logging();

    let store = S3ObjectStore::from_env().await;
    let uploader = Uploader::new(Arc::new(store), Arc::new(ThreadSleeper));
    let combiner = Arc::new(Combiner::new(uploader));

    let handler = service_fn(move |event| handle_request(Arc::clone(&combiner), event));
    lambda_runtime::run(handler).await
}
