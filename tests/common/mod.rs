//! CAR fixtures built in code

#![allow(dead_code)]

use car_idx::varint::encode_varint;
use ipld_core::cid::Cid;
use multihash::Multihash;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};

pub const RAW: u64 = 0x55;

/// `{version: 2}` header that opens every CARv2
pub const V2_PRAGMA: [u8; 11] = [
    0x0a, 0xa1, 0x67, 0x76, 0x65, 0x72, 0x73, 0x69, 0x6f, 0x6e, 0x02,
];

#[derive(Serialize)]
struct Header<'a> {
    roots: &'a [Cid],
    version: u64,
}

pub fn sha256_cid(codec: u64, data: &[u8]) -> Cid {
    let mh = Multihash::<64>::wrap(0x12, &Sha256::digest(data)).unwrap();
    Cid::new_v1(codec, mh)
}

pub fn sha512_cid(data: &[u8]) -> Cid {
    let mh = Multihash::<64>::wrap(0x13, &Sha512::digest(data)).unwrap();
    Cid::new_v1(RAW, mh)
}

pub fn v0_cid(data: &[u8]) -> Cid {
    let mh = Multihash::<64>::wrap(0x12, &Sha256::digest(data)).unwrap();
    Cid::new_v0(mh).unwrap()
}

/// `n` blocks of varying size, cycling through CIDv1/sha256, CIDv1/sha512
/// and CIDv0
pub fn blocks(n: usize) -> Vec<(Cid, Vec<u8>)> {
    (0..n)
        .map(|i| {
            let data = format!("block {i} ").repeat(1 + i % 7).into_bytes();
            let cid = match i % 3 {
                0 => sha256_cid(RAW, &data),
                1 => sha512_cid(&data),
                _ => v0_cid(&data),
            };
            (cid, data)
        })
        .collect()
}

pub fn header_v1(roots: &[Cid], version: u64) -> Vec<u8> {
    let header = serde_ipld_dagcbor::to_vec(&Header { roots, version }).unwrap();
    let mut out = Vec::new();
    encode_varint(header.len() as u64, &mut out);
    out.extend_from_slice(&header);
    out
}

pub fn section(cid: &Cid, data: &[u8]) -> Vec<u8> {
    let cid_bytes = cid.to_bytes();
    let mut out = Vec::new();
    encode_varint((cid_bytes.len() + data.len()) as u64, &mut out);
    out.extend_from_slice(&cid_bytes);
    out.extend_from_slice(data);
    out
}

pub fn car_v1(roots: &[Cid], blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let mut out = header_v1(roots, 1);
    for (cid, data) in blocks {
        out.extend_from_slice(&section(cid, data));
    }
    out
}

/// Wrap a CARv1 payload as CARv2, with `padding` bytes between the fixed
/// header and the payload and `trailer` bytes after it
pub fn car_v2(inner: &[u8], padding: usize, trailer: &[u8]) -> Vec<u8> {
    let data_offset = (V2_PRAGMA.len() + 40 + padding) as u64;
    let mut out = V2_PRAGMA.to_vec();
    out.extend_from_slice(&[0; 16]);
    out.extend_from_slice(&data_offset.to_le_bytes());
    out.extend_from_slice(&(inner.len() as u64).to_le_bytes());
    let index_offset = if trailer.is_empty() { 0 } else { data_offset + inner.len() as u64 };
    out.extend_from_slice(&index_offset.to_le_bytes());
    out.extend(std::iter::repeat_n(0u8, padding));
    out.extend_from_slice(inner);
    out.extend_from_slice(trailer);
    out
}

/// A CARv1 with `n` blocks rooted at the first one
pub fn sample_car(n: usize) -> (Vec<u8>, Vec<(Cid, Vec<u8>)>) {
    let blocks = blocks(n);
    let roots: Vec<Cid> = blocks.first().map(|(c, _)| *c).into_iter().collect();
    (car_v1(&roots, &blocks), blocks)
}
