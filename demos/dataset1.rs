use anyhow::Result;
use hapi_client::{Client, DataRequest, RequestOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Example program that calls the library API.
    // Set RUST_LOG=hapi_client=debug to watch cache hits and network requests.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = Client::from_env()?.with_progress(true);
    let server = "http://hapi-server.org/servers/TestData2.0/hapi";

    for entry in client.list_catalog(server)?.iter().take(5) {
        println!("{:<24} {}", entry.id, entry.title);
    }

    let request = DataRequest::new(server, "dataset1")
        .parameters("scalar,vector")
        .time_range("1970-01-01", "1970-01-01T00:00:11Z");
    let data = client.get(&request, &RequestOptions::default())?;

    println!(
        "{} records ({} format, from cache: {})",
        data.len(),
        data.format,
        data.from_cache
    );
    for record in &data.records {
        println!("{:?} {:?}", record.time(), record.get("vector").map(|v| v.values()));
    }
    Ok(())
}
