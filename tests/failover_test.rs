// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use carom::client::MemcachedClient;
use carom::config::ClientConfig;
use carom::failure::ThrottlingFailurePolicyFactory;
use carom::transcoder::CacheItem;

use common::FakeMemcached;

fn failover_client(servers: Vec<std::net::SocketAddr>) -> MemcachedClient {
    let mut config = ClientConfig::new(servers);
    config.pool.min_pool_size = 0;
    config.pool.max_pool_size = 4;
    config.pool.connect_timeout = Duration::from_millis(500);
    config.pool.receive_timeout = Duration::from_millis(1000);
    config.pool.queue_timeout = Duration::from_secs(1);
    config.pool.dead_timeout = Duration::from_millis(300);
    // one strike and the node is out, to keep the test deterministic
    config.pool.failure_policy = Arc::new(ThrottlingFailurePolicyFactory {
        failure_threshold: 1,
        reset_after: Duration::from_secs(2),
    });
    MemcachedClient::new(config).unwrap()
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn dead_node_is_excluded_then_resurrected() {
    let server_a = FakeMemcached::start();
    let server_b = FakeMemcached::start();
    let addr_a = server_a.addr();
    let addr_b = server_b.addr();

    let client = failover_client(vec![addr_a, addr_b]);

    // both nodes take traffic while healthy
    let item = CacheItem::new(0, b"payload".to_vec());
    let keys: Vec<String> = (0..40).map(|i| format!("spread-{}", i)).collect();
    for key in &keys {
        assert!(client.set(key, &item, 0).unwrap().success);
    }
    let key_on_a = keys
        .iter()
        .find(|key| client.locate(key) == Some(addr_a))
        .expect("some key should route to the first node")
        .clone();
    assert!(keys.iter().any(|key| client.locate(key) == Some(addr_b)));

    // kill the first node; the next operation against it fails and trips
    // the failure policy
    server_a.stop();
    assert!(client.set(&key_on_a, &item, 0).is_err());

    // the locator rebuild happens on the failure listener thread
    assert!(
        wait_until(Duration::from_secs(5), || {
            client.locate(&key_on_a) == Some(addr_b)
        }),
        "the dead node should disappear from the ring"
    );
    for key in &keys {
        assert_eq!(client.locate(key), Some(addr_b));
    }
    assert_eq!(client.working_servers(), vec![addr_b]);

    // traffic keeps flowing through the survivor
    assert!(client.set(&key_on_a, &item, 0).unwrap().success);

    // bring the node back on the same address; the resurrection timer
    // should fold it back into the ring within a probe interval or two
    let _server_a2 = FakeMemcached::bind(addr_a, None);
    assert!(
        wait_until(Duration::from_secs(10), || {
            client.locate(&key_on_a) == Some(addr_a)
        }),
        "the resurrected node should rejoin the ring"
    );
    assert_eq!(client.working_servers().len(), 2);

    // and it serves traffic again
    assert!(client.set(&key_on_a, &item, 0).unwrap().success);
}

#[test]
fn failure_events_reach_subscribers() {
    let server_a = FakeMemcached::start();
    let server_b = FakeMemcached::start();
    let addr_a = server_a.addr();

    let client = failover_client(vec![addr_a, server_b.addr()]);
    let failures = client.node_failures();

    let item = CacheItem::new(0, b"payload".to_vec());
    let key_on_a = (0..40)
        .map(|i| format!("event-{}", i))
        .find(|key| client.locate(key) == Some(addr_a))
        .expect("some key should route to the first node");

    server_a.stop();
    let _ = client.set(&key_on_a, &item, 0);

    let failed = failures
        .recv_timeout(Duration::from_secs(5))
        .expect("a failure event should be published");
    assert_eq!(failed, addr_a);
}

#[test]
fn whole_cluster_down_surfaces_as_unroutable() {
    let server = FakeMemcached::start();
    let addr_a = server.addr();
    // a cluster of two, both on the same soon-to-die server, so that every
    // node dies
    let server_b = FakeMemcached::start();
    let addr_b = server_b.addr();

    let client = failover_client(vec![addr_a, addr_b]);
    let item = CacheItem::new(0, b"payload".to_vec());
    assert!(client.set("seed", &item, 0).unwrap().success);

    server.stop();
    server_b.stop();

    // drive operations until both nodes have been marked dead
    for i in 0..20 {
        let _ = client.set(&format!("kill-{}", i), &item, 0);
        if client.working_servers().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            client.working_servers().is_empty()
        }),
        "every node should end up dead"
    );
    assert!(client.locate("anything").is_none());
    assert!(client.set("anything", &item, 0).is_err());
}
