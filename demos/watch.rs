use std::{sync::Arc, thread, time::Duration};

use iotivity::{
    config::{DiscoveryConfig, HandlerConfig},
    datatypes::{DeviceRecord, PowerReading},
    discovery::Discovery,
    handler::LightHandler,
    scheduler::ThreadScheduler,
};

// Discover lights and watch the power of every one found, for a minute
fn main() {
    env_logger::init();

    let scheduler = Arc::new(ThreadScheduler::new("watch"));
    let discovery = Discovery::new(DiscoveryConfig::default(), Arc::new(|_: &DeviceRecord| {}));

    let mut handlers = discovery
        .scan_once()
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            let listener = move |_: &str, reading: PowerReading| println!("{}\t{}", id, reading);
            let mut handler = LightHandler::new(Arc::new(listener), scheduler.clone());
            let config = HandlerConfig::new(&record.uri);
            match handler.initialize(&config) {
                Ok(()) => Some(handler),
                Err(err) => {
                    eprintln!("{}: {}", record.uri, err);
                    None
                }
            }
        })
        .collect::<Vec<_>>();

    thread::sleep(Duration::from_secs(60));

    for handler in handlers.iter_mut() {
        let _ = handler.dispose();
    }
}
