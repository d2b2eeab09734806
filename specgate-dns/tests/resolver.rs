//! Resolver behavior against in-process mock nameservers.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use specgate_dns::{DnsError, Resolver, ResolverConfig};

/// Mock server behavior per received query.
#[derive(Clone, Copy)]
enum Mode {
    /// Answer SERVFAIL.
    ServFail,
    /// Answer with one A record.
    Answer([u8; 4], u32),
    /// Answer with one PTR record.
    Pointer(&'static str),
    /// Never answer.
    Silent,
}

/// Bind a mock nameserver and return its address and a query counter.
async fn mock_nameserver(mode: Mode) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else { return };
            count2.fetch_add(1, Ordering::SeqCst);

            if matches!(mode, Mode::Silent) {
                continue;
            }

            let query = &buf[..len];
            // Question section runs from offset 12 to the end of the query
            let question = &query[12..];

            let rcode: u16 = match mode {
                Mode::ServFail => 2,
                _ => 0,
            };
            let answers: u16 = match mode {
                Mode::Answer(..) | Mode::Pointer(_) => 1,
                _ => 0,
            };

            let mut resp = Vec::new();
            resp.extend_from_slice(&query[..2]); // id
            resp.extend_from_slice(&(0x8000u16 | rcode).to_be_bytes());
            resp.extend_from_slice(&1u16.to_be_bytes());
            resp.extend_from_slice(&answers.to_be_bytes());
            resp.extend_from_slice(&[0; 4]);
            resp.extend_from_slice(question); // echo the question verbatim

            match mode {
                Mode::Answer(ip, ttl) => {
                    resp.extend_from_slice(&[0xc0, 12]); // name pointer to question
                    resp.extend_from_slice(&1u16.to_be_bytes()); // A
                    resp.extend_from_slice(&1u16.to_be_bytes()); // IN
                    resp.extend_from_slice(&ttl.to_be_bytes());
                    resp.extend_from_slice(&4u16.to_be_bytes());
                    resp.extend_from_slice(&ip);
                }
                Mode::Pointer(name) => {
                    let mut rdata = Vec::new();
                    for label in name.split('.') {
                        rdata.push(label.len() as u8);
                        rdata.extend_from_slice(label.as_bytes());
                    }
                    rdata.push(0);

                    resp.extend_from_slice(&[0xc0, 12]);
                    resp.extend_from_slice(&12u16.to_be_bytes()); // PTR
                    resp.extend_from_slice(&1u16.to_be_bytes());
                    resp.extend_from_slice(&60u32.to_be_bytes());
                    resp.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
                    resp.extend_from_slice(&rdata);
                }
                _ => {}
            }

            let _ = socket.send_to(&resp, peer).await;
        }
    });

    (addr, count)
}

fn test_config() -> ResolverConfig {
    ResolverConfig {
        query_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_secs(5),
        max_attempts: 2,
        ..ResolverConfig::default()
    }
}

#[tokio::test]
async fn resolves_through_healthy_nameserver_and_counts_failures() {
    let (bad, _) = mock_nameserver(Mode::ServFail).await;
    let (good, _) = mock_nameserver(Mode::Answer([1, 2, 3, 4], 300)).await;

    let resolver = Resolver::new(test_config());
    resolver.add_nameserver(&bad.to_string(), false).await.unwrap();
    resolver.add_nameserver(&good.to_string(), false).await.unwrap();

    let addrs = resolver.resolve("example.com", false).await.unwrap();
    assert_eq!(addrs, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);

    assert!(1 <= resolver.nameserver_failures(bad).unwrap());
    assert_eq!(resolver.nameserver_failures(good).unwrap(), 0);
}

#[tokio::test]
async fn cached_answers_produce_no_network_traffic() {
    let (addr, count) = mock_nameserver(Mode::Answer([5, 6, 7, 8], 300)).await;

    let resolver = Resolver::new(test_config());
    resolver.add_nameserver(&addr.to_string(), false).await.unwrap();

    let first = resolver.resolve("cached.example.com", false).await.unwrap();
    let queries_after_first = count.load(Ordering::SeqCst);
    let second = resolver.resolve("cached.example.com", false).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(count.load(Ordering::SeqCst), queries_after_first);
}

#[tokio::test]
async fn unresponsive_nameserver_times_out_after_retries() {
    let (addr, count) = mock_nameserver(Mode::Silent).await;

    let resolver = Resolver::new(test_config());
    resolver.add_nameserver(&addr.to_string(), false).await.unwrap();

    let err = resolver.resolve("dead.example.com", false).await.unwrap_err();
    assert_eq!(err, DnsError::Timeout);

    // One transmission per attempt
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reverse_lookup_returns_names() {
    let (addr, _) = mock_nameserver(Mode::Pointer("host.example.com")).await;

    let resolver = Resolver::new(test_config());
    resolver.add_nameserver(&addr.to_string(), false).await.unwrap();

    let names = resolver.reverse("1.2.3.4".parse().unwrap()).await.unwrap();
    assert_eq!(names, vec!["host.example.com".to_string()]);
}
