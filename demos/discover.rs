use iotivity::discovery::discover;

fn main() {
    env_logger::init();

    for record in discover() {
        println!("{}\t{}\t{}", record.thing_uid(), record.label(), record.uri);
    }
}
