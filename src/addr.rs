//! Address-family dispatch shared by writer and reader.
//!
//! IPv4 addresses (including IPv4-mapped IPv6) become 4-byte records; all
//! other IPv6 addresses become 16-byte records, with their top 8 bytes
//! doubling as the route-set record.

use std::net::IpAddr;

/// An address reduced to the record bytes of its family.
pub(crate) enum CanonicalIp {
    V4([u8; 4]),
    V6([u8; 16]),
}

pub(crate) fn canonicalize(ip: IpAddr) -> CanonicalIp {
    match ip {
        IpAddr::V4(v4) => CanonicalIp::V4(v4.octets()),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => CanonicalIp::V4(v4.octets()),
            None => CanonicalIp::V6(v6.octets()),
        },
    }
}

/// Zero the host bits of a record beyond `prefix` bits.
pub(crate) fn mask_record<const W: usize>(mut rec: [u8; W], prefix: u8) -> [u8; W] {
    let prefix = usize::from(prefix).min(W * 8);
    for (i, byte) in rec.iter_mut().enumerate() {
        let bit = i * 8;
        if prefix <= bit {
            *byte = 0;
        } else if prefix < bit + 8 {
            *byte &= 0xffu8 << (8 - (prefix - bit));
        }
    }
    rec
}

/// The route-set record of an IPv6 address: its top 64 bits.
pub(crate) fn route_prefix(octets: &[u8; 16]) -> [u8; 8] {
    let mut route = [0u8; 8];
    route.copy_from_slice(&octets[..8]);
    route
}
