use micro_client::interceptor::ExponentialBackoff;
use micro_client::{Client, ClientConfig, ClientRequest, ResponseCallbacks};
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let uri = std::env::args().nth(1).unwrap_or_else(|| "http://example.com/".to_owned());
    let config = ClientConfig { max_retries: 2, max_redirects: 5, decompress: true, ..ClientConfig::default() };
    let client = Client::builder()
        .config(config)
        .backoff(ExponentialBackoff { base: Duration::from_millis(100), max: Duration::from_secs(2) })
        .build()
        .expect("building the client failed");

    let request = match ClientRequest::get(&uri) {
        Ok(request) => request,
        Err(e) => {
            error!(cause = %e, "bad uri");
            return;
        }
    };
    request.context().set_callbacks(ResponseCallbacks::new().on_data(|chunk| info!(bytes = chunk.len(), "chunk received")));

    match client.execute(request).await {
        Ok(response) => {
            info!(status = %response.status(), ttfb = ?response.time_to_first_byte(), "response received");
            println!("{}", String::from_utf8_lossy(response.body()));
        }
        Err(e) => error!(cause = %e, "request failed"),
    }

    for metrics in client.pool_metrics() {
        info!(destination = %metrics.destination, connections = metrics.connections, idle = metrics.idle, "pool");
    }
}
