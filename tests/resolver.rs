use std::net::{IpAddr, Ipv4Addr};

use corio::resolver::{ResolveFlags, Resolver};
use corio::{Cond, IoContext, StopSource};

mod util;
use util::{block_on, init};

#[test]
fn numeric_lookup_yields_one_v4_entry() {
    init();
    let ioc = IoContext::new().unwrap();
    let resolver = Resolver::new(&ioc);

    let results = block_on(&ioc, async move {
        resolver
            .resolve(
                "127.0.0.1",
                "8080",
                ResolveFlags::NUMERIC_HOST | ResolveFlags::NUMERIC_SERVICE,
            )
            .await
    })
    .unwrap();

    assert_eq!(results.len(), 1);
    let entry = results.iter().next().unwrap();
    assert_eq!(
        entry.endpoint().ip(),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    );
    assert_eq!(entry.endpoint().port(), 8080);
    assert_eq!(entry.service_name(), "8080");
}

#[test]
fn localhost_resolves_to_loopback() {
    init();
    let ioc = IoContext::new().unwrap();
    let resolver = Resolver::new(&ioc);

    let results = block_on(&ioc, async move {
        resolver
            .resolve("localhost", "80", ResolveFlags::NUMERIC_SERVICE)
            .await
    })
    .unwrap();

    assert!(!results.is_empty());
    for entry in &results {
        assert!(entry.endpoint().ip().is_loopback());
        assert_eq!(entry.endpoint().port(), 80);
    }
}

#[test]
fn passive_lookup_with_empty_host() {
    init();
    let ioc = IoContext::new().unwrap();
    let resolver = Resolver::new(&ioc);

    let results = block_on(&ioc, async move {
        resolver
            .resolve(
                "",
                "0",
                ResolveFlags::PASSIVE | ResolveFlags::NUMERIC_SERVICE,
            )
            .await
    })
    .unwrap();
    assert!(!results.is_empty());
}

#[test]
fn bad_numeric_host_fails() {
    init();
    let ioc = IoContext::new().unwrap();
    let resolver = Resolver::new(&ioc);

    let result = block_on(&ioc, async move {
        resolver
            .resolve(
                "definitely-not-an-address",
                "80",
                ResolveFlags::NUMERIC_HOST | ResolveFlags::NUMERIC_SERVICE,
            )
            .await
    });
    assert!(result.is_err());
}

#[test]
fn stop_token_cancels_before_submission() {
    init();
    let ioc = IoContext::new().unwrap();
    let resolver = Resolver::new(&ioc);

    let source = StopSource::new();
    source.request_stop();
    let token = source.token();

    let result = block_on(&ioc, async move {
        resolver
            .resolve("localhost", "80", ResolveFlags::empty())
            .with_stop_token(token)
            .await
    });
    assert!(Cond::Canceled == result.unwrap_err());
}
