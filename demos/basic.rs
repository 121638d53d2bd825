// Copyright 2020 Joyent, Inc.

use std::sync::Mutex;

use slog::{o, Drain, Logger};

use carom::client::MemcachedClient;
use carom::config::ClientConfig;
use carom::transcoder::CacheItem;

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let mut config =
        ClientConfig::new(vec!["127.0.0.1:11211".parse().unwrap()]);
    config.pool.min_pool_size = 1;
    config.pool.max_pool_size = 5;
    config.log = Some(log);

    let client = MemcachedClient::new(config).expect("client");

    let item = CacheItem::new(0, b"hello from carom".to_vec());
    match client.set("demo-key", &item, 60) {
        Ok(result) if result.success => {
            println!("stored demo-key (cas {})", result.cas)
        }
        Ok(result) => println!(
            "store refused: status {:#06x} {:?}",
            result.status, result.message
        ),
        Err(e) => {
            println!("store failed: {}", e);
            return;
        }
    }

    match client.get("demo-key") {
        Ok(Some(found)) => println!(
            "fetched demo-key: {:?} (cas {})",
            String::from_utf8_lossy(&found.item.data),
            found.cas
        ),
        Ok(None) => println!("demo-key missing"),
        Err(e) => println!("fetch failed: {}", e),
    }

    if let Ok(versions) = client.server_versions() {
        for (server, version) in versions {
            println!("{} runs memcached {}", server, version);
        }
    }
}
