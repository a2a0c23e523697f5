use std::{thread, time::Duration};

use agora::{Config, Dht};
use tracing::Level;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let node = Dht::new(Config {
        initial_peer: std::env::args().nth(1),
        ..Default::default()
    })
    .unwrap();

    println!(
        "node {} listening on {:?}",
        node.id(),
        node.local_addr_v4()
    );

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
