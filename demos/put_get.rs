use std::net::Ipv4Addr;

use agora::{Config, Dht};
use tracing::Level;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let local = Config {
        ipv4: Some(Ipv4Addr::LOCALHOST),
        ipv4_port: Some(0),
        ..Default::default()
    };

    let first = Dht::new(local.clone()).unwrap();
    let second = Dht::new(Config {
        initial_peer: Some(first.local_addr_v4().unwrap().to_string()),
        ..local
    })
    .unwrap();

    second.put(b"greeting", &b"hello overlay"[..]).unwrap();
    let value = second.get(b"greeting").unwrap();

    println!("loaded: {}", String::from_utf8_lossy(&value));

    second.shutdown();
    first.shutdown();
}
