use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use memoffset::offset_of;

use ip_blocker::layout::Header;
use ip_blocker::{Client, Error, Server};

fn unique_name(tag: &str) -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/ip-blocker-test-{tag}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn dev_shm_path(name: &str) -> String {
    format!("/dev/shm/{}", name.trim_start_matches('/'))
}

fn ip(s: &str) -> IpAddr {
    s.parse().expect("test address literal")
}

#[test]
fn ipv4_single_insert_and_remove() {
    let name = unique_name("v4-single");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.insert(ip("192.0.2.0")).unwrap();
    assert_eq!(server.count().unwrap(), (1, 0, 0));
    assert!(client.contains(ip("192.0.2.0")).unwrap());
    assert!(!client.contains(ip("192.0.2.1")).unwrap());

    server.remove(ip("192.0.2.0")).unwrap();
    assert_eq!(server.count().unwrap(), (0, 0, 0));
    assert!(!client.contains(ip("192.0.2.0")).unwrap());
    assert!(!client.contains(ip("192.0.2.1")).unwrap());

    server.unlink().unwrap();
}

#[test]
fn ipv4_range_insert() {
    let name = unique_name("v4-range");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.insert_range(ip("192.0.2.0"), 24).unwrap();
    assert_eq!(server.count().unwrap(), (256, 0, 0));
    assert_eq!(client.count().unwrap(), (256, 0, 0));
    assert!(client.contains(ip("192.0.2.0")).unwrap());
    assert!(client.contains(ip("192.0.2.255")).unwrap());
    assert!(!client.contains(ip("192.0.3.0")).unwrap());

    server.remove_range(ip("192.0.2.0"), 24).unwrap();
    assert_eq!(client.count().unwrap(), (0, 0, 0));

    server.unlink().unwrap();
}

#[test]
fn wide_ipv6_range_becomes_routes() {
    let name = unique_name("v6-routes");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    // /58 is at most /64 wide, so it lands in the route set: 2^(64-58)
    // entries of 8 bytes.
    server.insert_range(ip("2001:db8::"), 58).unwrap();
    assert_eq!(server.count().unwrap(), (0, 0, 64));
    assert!(client.contains(ip("2001:db8::dead:beef")).unwrap());
    assert!(client.contains(ip("2001:db8:0:3f::1")).unwrap());
    assert!(!client.contains(ip("2001:db8:0:40::1")).unwrap());

    // Route entries are not addressable by single-IP remove.
    server.remove(ip("2001:db8::")).unwrap();
    assert_eq!(server.count().unwrap(), (0, 0, 64));
    assert!(client.contains(ip("2001:db8::dead:beef")).unwrap());

    server.remove_range(ip("2001:db8::"), 58).unwrap();
    assert!(!client.contains(ip("2001:db8::dead:beef")).unwrap());
    assert_eq!(server.count().unwrap(), (0, 0, 0));

    server.unlink().unwrap();
}

#[test]
fn narrow_ipv6_range_expands_into_addresses() {
    let name = unique_name("v6-narrow");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.insert_range(ip("2001:db8::"), 126).unwrap();
    assert_eq!(server.count().unwrap(), (0, 4, 0));
    for tail in 0..4 {
        assert!(client.contains(ip(&format!("2001:db8::{tail}"))).unwrap());
    }
    assert!(!client.contains(ip("2001:db8::4")).unwrap());

    // Unlike route entries, expanded addresses respond to single remove.
    server.remove(ip("2001:db8::1")).unwrap();
    assert_eq!(server.count().unwrap(), (0, 3, 0));
    assert!(!client.contains(ip("2001:db8::1")).unwrap());

    server.unlink().unwrap();
}

#[test]
fn overlapping_range_insert_keeps_the_tail() {
    let name = unique_name("overlap");
    let server = Server::new(&name, 0o600).unwrap();

    server.insert(ip("192.0.2.253")).unwrap();
    server.insert(ip("192.0.2.255")).unwrap();
    server.insert(ip("192.0.3.0")).unwrap();
    server.insert_range(ip("192.0.2.0"), 24).unwrap();

    // 256 in-range records plus 192.0.3.0 beyond the range.
    assert_eq!(server.count().unwrap(), (257, 0, 0));

    let client = Client::open(&name).unwrap();
    assert!(client.contains(ip("192.0.2.0")).unwrap());
    assert!(client.contains(ip("192.0.2.254")).unwrap());
    assert!(client.contains(ip("192.0.3.0")).unwrap());
    assert!(!client.contains(ip("192.0.3.1")).unwrap());

    server.unlink().unwrap();
}

#[test]
fn remove_range_with_no_members_changes_nothing() {
    let name = unique_name("remove-none");
    let server = Server::new(&name, 0o600).unwrap();

    server.insert(ip("192.0.1.0")).unwrap();
    server.remove_range(ip("192.0.2.0"), 30).unwrap();
    assert_eq!(server.count().unwrap(), (1, 0, 0));

    server.unlink().unwrap();
}

#[test]
fn v4_mapped_ipv6_dispatches_to_the_v4_set() {
    let name = unique_name("v4-mapped");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.insert(ip("::ffff:192.0.2.1")).unwrap();
    assert_eq!(server.count().unwrap(), (1, 0, 0));
    assert!(client.contains(ip("192.0.2.1")).unwrap());
    assert!(client.contains(ip("::ffff:192.0.2.1")).unwrap());

    server.unlink().unwrap();
}

#[test]
fn batched_changes_are_invisible_until_commit() {
    let name = unique_name("batch");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.batch().unwrap();
    assert!(server.is_batching());
    assert!(matches!(server.batch(), Err(Error::AlreadyBatching)));

    server.insert(ip("192.0.2.0")).unwrap();
    assert_eq!(server.count().unwrap(), (0, 0, 0));
    assert!(!client.contains(ip("192.0.2.0")).unwrap());

    server.commit().unwrap();
    assert!(!server.is_batching());
    assert_eq!(server.count().unwrap(), (1, 0, 0));
    assert!(client.contains(ip("192.0.2.0")).unwrap());

    assert!(matches!(server.commit(), Err(Error::NotBatching)));

    server.unlink().unwrap();
}

#[test]
fn clear_empties_all_three_sets() {
    let name = unique_name("clear");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.insert_range(ip("10.1.0.0"), 24).unwrap();
    server.insert(ip("2001:db8::77")).unwrap();
    server.insert_range(ip("2001:db8:2::"), 48).unwrap();
    assert_eq!(server.count().unwrap(), (256, 1, 65536));

    server.clear().unwrap();
    assert_eq!(server.count().unwrap(), (0, 0, 0));
    assert!(!client.contains(ip("10.1.0.7")).unwrap());
    assert!(!client.contains(ip("2001:db8::77")).unwrap());
    assert!(!client.contains(ip("2001:db8:2::1")).unwrap());

    server.unlink().unwrap();
}

#[test]
fn oversized_ranges_are_rejected() {
    let name = unique_name("too-large");
    let server = Server::new(&name, 0o600).unwrap();

    // A /0 over IPv6 would be 2^128 records.
    assert!(matches!(
        server.insert_range(ip("::"), 0),
        Err(Error::RangeTooLarge)
    ));
    // Still 2^64 route records.
    assert!(matches!(
        server.insert_range(ip("8000::"), 1),
        Err(Error::RangeTooLarge)
    ));
    assert_eq!(server.count().unwrap(), (0, 0, 0));

    server.unlink().unwrap();
}

#[test]
fn client_remaps_across_growth_and_shrink() {
    let name = unique_name("remap");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    assert!(!client.contains(ip("10.0.0.1")).unwrap());

    // Grow the file well past the page the client originally mapped.
    server.insert_range(ip("10.0.0.0"), 16).unwrap();
    assert!(client.contains(ip("10.0.255.255")).unwrap());
    assert_eq!(client.count().unwrap(), (65536, 0, 0));

    // Shrink it back down; the client must follow.
    server.clear().unwrap();
    assert!(!client.contains(ip("10.0.255.255")).unwrap());
    assert_eq!(client.count().unwrap(), (0, 0, 0));

    // And grow again.
    server.insert_range(ip("172.16.4.0"), 22).unwrap();
    assert!(client.contains(ip("172.16.7.255")).unwrap());

    server.unlink().unwrap();
}

#[test]
fn revision_increases_across_commits() {
    let name = unique_name("revision");
    let server = Server::new(&name, 0o600).unwrap();
    let path = dev_shm_path(&name);

    let read_revision = || {
        let mut file = OpenOptions::new().read(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset_of!(Header, revision) as u64))
            .unwrap();
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf).unwrap();
        u32::from_ne_bytes(buf)
    };

    let mut last = read_revision();
    assert!(last >= 1);
    for i in 0..10u8 {
        server.insert(ip(&format!("10.9.0.{i}"))).unwrap();
        let now = read_revision();
        assert!(now > last, "revision went {last} -> {now}");
        last = now;
    }

    server.unlink().unwrap();
}

#[test]
fn open_rejects_flipped_version_bits() {
    let name = unique_name("version");
    let server = Server::new(&name, 0o600).unwrap();
    let path = dev_shm_path(&name);

    assert!(Client::open(&name).is_ok());

    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf).unwrap();
    let version = u32::from_ne_bytes(buf);

    for bit in [0, 7, 30, 31] {
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&(version ^ (1 << bit)).to_ne_bytes()).unwrap();
        assert!(
            matches!(Client::open(&name), Err(Error::InvalidSharedMemory)),
            "version bit {bit} flip was accepted"
        );
    }

    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&version.to_ne_bytes()).unwrap();
    assert!(Client::open(&name).is_ok());

    server.unlink().unwrap();
}

#[test]
fn open_rejects_corrupted_descriptors() {
    let name = unique_name("corrupt");
    let server = Server::new(&name, 0o600).unwrap();
    server.insert(ip("192.0.2.1")).unwrap();
    let path = dev_shm_path(&name);

    let len_offset = (offset_of!(Header, ip4) + size_of::<usize>()) as u64;
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

    file.seek(SeekFrom::Start(len_offset)).unwrap();
    let mut buf = [0u8; size_of::<usize>()];
    file.read_exact(&mut buf).unwrap();
    let good_len = usize::from_ne_bytes(buf);

    // Not a multiple of the record width.
    file.seek(SeekFrom::Start(len_offset)).unwrap();
    file.write_all(&6usize.to_ne_bytes()).unwrap();
    assert!(matches!(Client::open(&name), Err(Error::InvalidSharedMemory)));

    // Region escaping the mapping.
    file.seek(SeekFrom::Start(len_offset)).unwrap();
    file.write_all(&(1usize << 40).to_ne_bytes()).unwrap();
    assert!(matches!(Client::open(&name), Err(Error::InvalidSharedMemory)));

    file.seek(SeekFrom::Start(len_offset)).unwrap();
    file.write_all(&good_len.to_ne_bytes()).unwrap();
    assert!(Client::open(&name).is_ok());

    server.unlink().unwrap();
}

#[test]
fn open_rejects_undersized_segments() {
    let name = unique_name("tiny");
    let path = dev_shm_path(&name);
    {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(8).unwrap();
    }
    assert!(matches!(Client::open(&name), Err(Error::InvalidSharedMemory)));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn open_missing_segment_passes_through_not_found() {
    match Client::open(&unique_name("absent")) {
        Err(Error::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
        other => panic!("unexpected open result: {other:?}"),
    }
}

#[test]
fn create_is_exclusive_until_unlink() {
    let name = unique_name("exclusive");
    let server = Server::new(&name, 0o600).unwrap();

    match Server::new(&name, 0o600) {
        Err(Error::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists),
        other => panic!("unexpected create result: {:?}", other.map(|_| ())),
    }

    server.unlink().unwrap();
    let server = Server::new(&name, 0o600).unwrap();
    server.unlink().unwrap();
}

#[test]
fn closed_server_rejects_every_operation() {
    let name = unique_name("closed-server");
    let server = Server::new(&name, 0o600).unwrap();
    server.close().unwrap();

    assert!(matches!(server.insert(ip("10.0.0.1")), Err(Error::Closed)));
    assert!(matches!(server.remove(ip("10.0.0.1")), Err(Error::Closed)));
    assert!(matches!(server.insert_range(ip("10.0.0.0"), 24), Err(Error::Closed)));
    assert!(matches!(server.clear(), Err(Error::Closed)));
    assert!(matches!(server.batch(), Err(Error::Closed)));
    assert!(matches!(server.commit(), Err(Error::Closed)));
    assert!(matches!(server.count(), Err(Error::Closed)));
    assert!(matches!(server.close(), Err(Error::Closed)));
    assert!(!server.is_batching());

    // Unlink still works on a closed server.
    server.unlink().unwrap();
}

#[test]
fn closed_client_rejects_queries() {
    let name = unique_name("closed-client");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    client.close().unwrap();
    assert!(matches!(client.contains(ip("10.0.0.1")), Err(Error::Closed)));
    assert!(matches!(client.count(), Err(Error::Closed)));
    assert!(matches!(client.close(), Err(Error::Closed)));

    server.unlink().unwrap();
}

#[test]
fn over_long_prefixes_are_rejected_as_invalid_input() {
    let name = unique_name("bad-prefix");
    let server = Server::new(&name, 0o600).unwrap();

    assert!(matches!(
        server.insert_range(ip("192.0.2.0"), 33),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::InvalidInput
    ));
    assert!(matches!(
        server.remove_range(ip("2001:db8::"), 129),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::InvalidInput
    ));
    assert_eq!(server.count().unwrap(), (0, 0, 0));

    server.unlink().unwrap();
}

#[test]
fn readers_race_a_committing_writer_safely() {
    let name = unique_name("hammer");
    let server = Arc::new(Server::new(&name, 0o600).unwrap());

    // A sentinel that stays blocked through the whole run.
    server.insert(ip("10.0.0.1")).unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let name = name.clone();
        readers.push(thread::spawn(move || {
            let client = Client::open(&name).unwrap();
            for i in 0..1500u32 {
                assert!(client.contains(ip("10.0.0.1")).unwrap());
                let probe = format!("172.16.{}.{}", (i >> 8) & 0xff, i & 0xff);
                // Membership of the churned range may be either way, but
                // the lookup must never fail or tear.
                client.contains(ip(&probe)).unwrap();
            }
        }));
    }

    let writer = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            for round in 0..60 {
                server.insert_range(ip("172.16.0.0"), 20).unwrap();
                if round % 2 == 0 {
                    server.remove_range(ip("172.16.0.0"), 20).unwrap();
                } else {
                    // Clear and re-insert the sentinel in one batch so no
                    // commit ever publishes a state without it.
                    server.batch().unwrap();
                    server.clear().unwrap();
                    server.insert(ip("10.0.0.1")).unwrap();
                    server.commit().unwrap();
                }
            }
        })
    };

    for reader in readers {
        reader.join().expect("reader thread panicked");
    }
    writer.join().expect("writer thread panicked");

    assert!(Client::open(&name).unwrap().contains(ip("10.0.0.1")).unwrap());
    server.unlink().unwrap();
}

#[test]
fn batched_bulk_update_commits_once() {
    let name = unique_name("bulk");
    let server = Server::new(&name, 0o600).unwrap();
    let client = Client::open(&name).unwrap();

    server.batch().unwrap();
    for octet in 0..32u8 {
        server.insert(ip(&format!("198.51.100.{octet}"))).unwrap();
    }
    server.insert_range(ip("203.0.113.0"), 24).unwrap();
    server.remove_range(ip("203.0.113.128"), 25).unwrap();
    assert_eq!(client.count().unwrap(), (0, 0, 0));

    server.commit().unwrap();
    assert_eq!(client.count().unwrap(), (32 + 128, 0, 0));
    assert!(client.contains(ip("198.51.100.31")).unwrap());
    assert!(client.contains(ip("203.0.113.127")).unwrap());
    assert!(!client.contains(ip("203.0.113.128")).unwrap());

    server.unlink().unwrap();
}
