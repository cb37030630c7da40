use std::time::Duration;

use iotivity::tokio::discovery;

#[tokio::main]
async fn main() {
    env_logger::init();

    let duration = Duration::from_secs(2);
    match discovery::with_timeout(duration).await {
        Ok(devices) => devices.into_iter().for_each(|record| {
            println!("{}\t{}", record.id, record.uri);
        }),
        Err(err) => eprintln!("Discovery failed: {}", err),
    }
}
