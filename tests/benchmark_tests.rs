//! Performance benchmarks for the wire codec and filtering

use browser::Filter;
use shared::{
    decode_info_response, decode_master_fragment, decode_status_response, encode_info_response,
    encode_master_response, encode_status_response, strip_color_codes, Identity, Player,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

fn sample_info() -> HashMap<String, String> {
    [
        ("hostname", "^1[FR] ^7Urban ^4Zone"),
        ("mapname", "ut4_turnpike"),
        ("gametype", "7"),
        ("clients", "12"),
        ("sv_maxclients", "20"),
        ("protocol", "68"),
        ("modversion", "4.3.4"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Benchmarks decoding a full master fragment
#[test]
fn benchmark_master_fragment_decode() {
    let servers: Vec<(Ipv4Addr, u16)> = (0..196u32)
        .map(|i| (Ipv4Addr::from(0x0A00_0000 + i), 27960))
        .collect();
    let fragment = encode_master_response(&servers).remove(0);

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let decoded = decode_master_fragment(&fragment).unwrap();
        assert_eq!(decoded.len(), 196);
    }

    let duration = start.elapsed();
    println!(
        "Master fragment decode: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // 196 records per fragment
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks decoding info responses
#[test]
fn benchmark_info_decode() {
    let data = encode_info_response(&sample_info());

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let info = decode_info_response(&data).unwrap();
        assert_eq!(info.len(), 8);
    }

    let duration = start.elapsed();
    println!(
        "Info decode: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks decoding a status response from a full server
#[test]
fn benchmark_status_decode() {
    let players: Vec<Player> = (0..32)
        .map(|i| Player::new(format!("Player {}", i), i, 50 + i))
        .collect();
    let data = encode_status_response(&sample_info(), &players);

    let iterations = 2_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let (_, decoded) = decode_status_response(&data).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    let duration = start.elapsed();
    println!(
        "Status decode: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks identity hashing used to match replies to servers
#[test]
fn benchmark_identity() {
    let iterations = 20_000;
    let start = Instant::now();

    for i in 0..iterations {
        let _ = Identity::new("192.168.1.10", (i % 65_536) as u16);
    }

    let duration = start.elapsed();
    println!(
        "Identity: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks filtering with hostname sanitising
#[test]
fn benchmark_filter_matching() {
    let info = sample_info();
    let filter = Filter::new()
        .with("gametype", "^(4|7)$")
        .with("hostname", "urban");

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut info = info.clone();
        if let Some(hostname) = info.get_mut("hostname") {
            *hostname = strip_color_codes(hostname);
        }
        assert!(filter.matches(&info));
    }

    let duration = start.elapsed();
    println!(
        "Filter matching: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}
