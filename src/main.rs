extern crate iotivity;

use std::{sync::Arc, thread, time::Duration};

use clap::{App, Arg, ArgMatches, SubCommand};
use rayon::prelude::*;

use iotivity::{
    config::{DiscoveryConfig, HandlerConfig},
    datatypes::{parse_power, DeviceRecord, PowerReading},
    discovery::Discovery,
    handler::LightHandler,
    scheduler::ThreadScheduler,
    uri::CoapUri,
    DefaultProtocol, Protocol,
};

fn command_discover(matches: &ArgMatches, json: bool) {
    let mut config = DiscoveryConfig::default();
    if let Some(window) = millis(matches, "window") {
        config.window_ms = window;
    }

    let discovery = Discovery::new(config, Arc::new(|_: &DeviceRecord| {}));
    for record in discovery.run_discovery_cycle() {
        if json {
            discover_print_json(&record);
        } else {
            discover_print_human(&record);
        }
    }
}

fn discover_print_human(record: &DeviceRecord) {
    println!("{}\t{}\t{}", pad(&record.id, 10), pad(&record.thing_uid(), 24), record.uri);
}

fn discover_print_json(record: &DeviceRecord) {
    match serde_json::to_string(record) {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("{}", err),
    }
}

fn pad(value: &str, padding: usize) -> String {
    let pad = " ".repeat(padding.saturating_sub(value.len()));
    format!("{}{}", value, pad)
}

fn millis(matches: &ArgMatches, name: &str) -> Option<u64> {
    matches.value_of(name).and_then(|value| value.parse().ok())
}

fn read_power(protocol: &DefaultProtocol, uri: &str, timeout: Duration) -> PowerReading {
    let result = uri.parse::<CoapUri>().and_then(|target| {
        let payload = protocol.get(&target, timeout)?;
        parse_power(&payload)
    });
    if let Err(err) = &result {
        log::warn!("{}: {}", uri, err);
    }
    PowerReading::from(result)
}

fn command_poll(matches: &ArgMatches, json: bool) {
    let timeout = Duration::from_millis(millis(matches, "timeout").unwrap_or(1000));
    let uris: Vec<&str> = matches.values_of("uri").map(|v| v.collect()).unwrap_or_default();
    let protocol = DefaultProtocol::new();

    let readings: Vec<(&str, PowerReading)> = uris
        .par_iter()
        .map(|uri| (*uri, read_power(&protocol, uri, timeout)))
        .collect();

    for (uri, reading) in readings {
        if json {
            println!("{}", serde_json::json!({ "uri": uri, "power": reading }));
        } else {
            println!("{}\t{}", uri, reading);
        }
    }
}

fn command_watch(matches: &ArgMatches) {
    let uri = matches.value_of("uri").unwrap_or_default();
    let mut config = HandlerConfig::new(uri);
    if let Some(interval) = matches.value_of("interval").and_then(|v| v.parse().ok()) {
        config.refresh_secs = interval;
    }

    let listener = |channel: &str, reading: PowerReading| println!("{}\t{}", channel, reading);
    let mut handler = LightHandler::new(Arc::new(listener), Arc::new(ThreadScheduler::default()));
    if let Err(err) = handler.initialize(&config) {
        eprintln!("{}", err);
        return;
    }

    loop {
        thread::park();
    }
}

fn main() {
    env_logger::init();

    let matches = App::new("IoTivity light CLI")
        .version("0.1")
        .about("Discover and poll IoTivity CoAP lights on the local network.")
        .arg(Arg::with_name("json")
            .long("json")
            .takes_value(false)
            .help("Respond with JSON.")
        )
        .subcommand(SubCommand::with_name("discover")
            .about("Discover lights on the local network")
            .arg(Arg::with_name("window")
                .long("window")
                .takes_value(true)
                .value_name("MS")
                .help("How long to listen for replies.")
            )
        )
        .subcommand(SubCommand::with_name("poll")
            .about("Read the power of one or more lights once")
            .arg(Arg::with_name("uri")
                .required(true)
                .multiple(true)
                .help("coap:// address of a light resource")
            )
            .arg(Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .value_name("MS")
                .help("How long to wait for each light.")
            )
        )
        .subcommand(SubCommand::with_name("watch")
            .about("Poll a light until interrupted")
            .arg(Arg::with_name("uri")
                .required(true)
                .help("coap:// address of a light resource")
            )
            .arg(Arg::with_name("interval")
                .long("interval")
                .takes_value(true)
                .value_name("SECS")
                .help("Seconds between polls.")
            )
        )
        .get_matches();

    let json = matches.is_present("json");
    match matches.subcommand() {
        ("discover", Some(sub)) => command_discover(sub, json),
        ("poll", Some(sub)) => command_poll(sub, json),
        ("watch", Some(sub)) => command_watch(sub),
        _ => println!("{}", matches.usage()),
    }
}
