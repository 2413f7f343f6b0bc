//! Hot-path benchmarks: framing, datagram sealing, ACL evaluation and
//! address lookup

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rvpngw::auth::Identity;
use rvpngw::crypto::EpochCipher;
use rvpngw::policy::{acl_permits, GroupPolicy};
use rvpngw::pool::PoolSet;
use rvpngw::protocol::ip::{build_ipv4, destination, inspect, PROTO_TCP, PROTO_UDP};
use rvpngw::protocol::Frame;
use rvpngw::session::{Lease, Session, SessionId, SessionInit, SessionRegistry};
use rvpngw::Config;
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;

const BENCH_CONFIG: &str = r#"
[server]
listen = "0.0.0.0:443"
hostname = "vpn.example.com"

[tls]
cert_path = "cert.pem"
key_path = "key.pem"

[[pools]]
name = "staff"
network = "10.8.0.0/16"

[[groups]]
name = "staff"
pool = "staff"
acl = [
    { action = "allow", network = "10.0.1.0/24", protocol = "tcp", ports = [443] },
    { action = "allow", network = "10.0.2.0/24", protocol = "udp", ports = [53] },
    { action = "allow", network = "10.0.3.0/24", protocol = "icmp" },
    { action = "deny", network = "0.0.0.0/0" },
]
"#;

fn packet(size: usize) -> Vec<u8> {
    build_ipv4(
        Ipv4Addr::new(10, 8, 0, 2),
        Ipv4Addr::new(10, 0, 1, 10),
        PROTO_TCP,
        443,
        &vec![0xabu8; size],
    )
}

fn framing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for size in [64usize, 512, 1400] {
        let payload = Bytes::from(packet(size));
        group.throughput(Throughput::Bytes(payload.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| {
                let encoded = Frame::data(black_box(payload.clone())).encode().unwrap();
                black_box(encoded);
            });
        });

        let encoded = Frame::data(payload.clone()).encode().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                let frame = Frame::decode(black_box(&mut buf)).unwrap();
                black_box(frame);
            });
        });
    }

    group.finish();
}

fn sealing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("datagram_sealing");
    let cipher = EpochCipher::derive(&[7u8; 32], &[9u8; 32], 1).unwrap();

    for size in [64usize, 512, 1400] {
        let payload = packet(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));

        group.bench_with_input(BenchmarkId::new("seal", size), &payload, |b, payload| {
            b.iter(|| {
                let sealed = cipher.seal(0, black_box(payload)).unwrap();
                black_box(sealed);
            });
        });

        let sealed = cipher.seal(0, &payload).unwrap();
        group.bench_with_input(BenchmarkId::new("open", size), &sealed, |b, sealed| {
            b.iter(|| {
                let opened = cipher.open(black_box(sealed)).unwrap();
                black_box(opened);
            });
        });
    }

    group.finish();
}

fn acl_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("acl");
    let config = Config::from_str(BENCH_CONFIG).unwrap();
    let policy = GroupPolicy::from_config(&config.groups[0], &config);

    let allowed = packet(64);
    let denied = build_ipv4(
        Ipv4Addr::new(10, 8, 0, 2),
        Ipv4Addr::new(192, 168, 1, 1),
        PROTO_UDP,
        123,
        &[0u8; 48],
    );

    group.bench_function("inspect", |b| {
        b.iter(|| black_box(inspect(black_box(&allowed)).unwrap()));
    });
    group.bench_function("destination", |b| {
        b.iter(|| black_box(destination(black_box(&allowed))));
    });
    for (name, packet) in [("first_rule", &allowed), ("fall_through", &denied)] {
        let info = inspect(packet).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(acl_permits(&policy.acl, black_box(&info))));
        });
    }

    group.finish();
}

fn registry_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let config = Config::from_str(BENCH_CONFIG).unwrap();
    let pools = PoolSet::from_config(&config).unwrap();
    let pool = pools.get("staff").unwrap();
    let policy = GroupPolicy::from_config(&config.groups[0], &config);

    for count in [100usize, 1000, 10_000] {
        let registry = SessionRegistry::new();
        let mut addresses: Vec<IpAddr> = Vec::with_capacity(count);
        let mut receivers = Vec::with_capacity(count);
        for i in 0..count {
            let id = SessionId::generate().unwrap();
            let user = format!("user{i}");
            let address = pool.allocate(&user, id).unwrap();
            let (session, commands) = Session::new(SessionInit {
                id,
                identity: Identity {
                    username: user,
                    group: "staff".into(),
                },
                policy: policy.clone(),
                leases: vec![Lease {
                    pool: Arc::clone(&pool),
                    address,
                }],
                mtu: 1400,
                hostname: None,
                remote: "198.51.100.1:443".parse().unwrap(),
                master_secret: None,
                outbound_capacity: 16,
            });
            registry.insert(session).unwrap();
            addresses.push(address);
            receivers.push(commands);
        }

        group.bench_with_input(BenchmarkId::new("lookup_addr", count), &addresses, |b, addresses| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % addresses.len();
                black_box(registry.lookup_addr(black_box(&addresses[i])));
            });
        });

        for address in &addresses {
            if let Some(session) = registry.lookup_addr(address) {
                registry.remove(&session.id());
            }
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    framing_benchmark,
    sealing_benchmark,
    acl_benchmark,
    registry_benchmark
);
criterion_main!(benches);
