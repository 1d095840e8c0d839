#![allow(dead_code)]

use base64::Engine;

/// Minimal V4 public key: primary key packet plus one user id packet per
/// entry, old-format headers.
pub fn key_packets(seed: u8, user_ids: &[&str]) -> Vec<u8> {
    let mut primary = vec![4u8, 0, 0, 0, seed, 22];
    primary.extend_from_slice(&[seed; 32]);
    let mut out = packet(6, &primary);
    for uid in user_ids {
        out.extend(packet(13, uid.as_bytes()));
    }
    out
}

fn packet(tag: u8, body: &[u8]) -> Vec<u8> {
    assert!(body.len() < 256);
    let mut out = vec![0x80 | (tag << 2), body.len() as u8];
    out.extend_from_slice(body);
    out
}

/// Armored without a checksum line, which readers must accept.
pub fn armored_key(seed: u8, user_ids: &[&str]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(key_packets(seed, user_ids));
    let mut out = String::from("-----BEGIN PGP PUBLIC KEY BLOCK-----\nVersion: fixture\n\n");
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END PGP PUBLIC KEY BLOCK-----\n");
    out
}

/// Stand-in for a PGP-encrypted share: hex, distinct per index.
pub fn share(tag: &str, index: usize) -> String {
    hex::encode(format!("{}-share-{}", tag, index))
}
