//! Just enough OpenPGP to route shares.
//!
//! Shares come back from the control plane already encrypted, so nothing here
//! decrypts or verifies signatures. We only need to:
//! - turn an ASCII-armored key bundle into binary key material,
//! - walk the packet stream to find the primary key and its user ids,
//! - derive a V4 fingerprint so service-reported fingerprints can be matched.

use anyhow::{anyhow, Result};
use base64::Engine;
use sha1::{Digest, Sha1};
use std::sync::OnceLock;

const TAG_SECRET_KEY: u8 = 5;
const TAG_PUBLIC_KEY: u8 = 6;
const TAG_USER_ID: u8 = 13;

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;

/// A single OpenPGP packet with its (reassembled) body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub tag: u8,
    pub body: Vec<u8>,
}

/// One user id of a key, with the mail address it names if there is one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// The first transferable public key found in a key blob.
#[derive(Clone, Debug)]
pub struct PublicKey {
    primary: Vec<u8>,
    identities: Vec<Identity>,
}

impl PublicKey {
    /// Parses binary key material. Packets after the first key's user ids
    /// (subkeys, signatures, further keys) are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let packets = parse_packets(data)?;
        let mut iter = packets.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| anyhow!("key material contains no packets"))?;
        if first.tag != TAG_PUBLIC_KEY {
            return Err(anyhow!(
                "expected a public key packet first, found tag {}",
                first.tag
            ));
        }
        let mut identities = Vec::new();
        for packet in iter {
            match packet.tag {
                TAG_PUBLIC_KEY | TAG_SECRET_KEY => break,
                TAG_USER_ID => {
                    let user_id = String::from_utf8_lossy(&packet.body).into_owned();
                    let email = extract_email(&user_id);
                    identities.push(Identity { user_id, email });
                }
                _ => {}
            }
        }
        Ok(Self {
            primary: first.body,
            identities,
        })
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Every mail address declared by the key, in packet order, without duplicates.
    pub fn emails(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for email in self.identities.iter().filter_map(|i| i.email.as_ref()) {
            if !out.iter().any(|seen| seen.eq_ignore_ascii_case(email)) {
                out.push(email.clone());
            }
        }
        out
    }

    pub fn version(&self) -> Option<u8> {
        self.primary.first().copied()
    }

    /// Lower-case hex V4 fingerprint, or `None` for other key versions.
    pub fn fingerprint(&self) -> Option<String> {
        if self.version() != Some(4) || self.primary.len() > u16::MAX as usize {
            return None;
        }
        let mut hasher = Sha1::new();
        hasher.update([0x99]);
        hasher.update((self.primary.len() as u16).to_be_bytes());
        hasher.update(&self.primary);
        Some(hex::encode(hasher.finalize()))
    }
}

/// Splits a binary OpenPGP message into packets.
pub fn parse_packets(data: &[u8]) -> Result<Vec<Packet>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let header = data[pos];
        pos += 1;
        if header & 0x80 == 0 {
            return Err(anyhow!("invalid packet header 0x{:02x} at offset {}", header, pos - 1));
        }
        if header & 0x40 != 0 {
            let tag = header & 0x3f;
            let mut body = Vec::new();
            loop {
                match read_new_length(data, &mut pos)? {
                    BodyLength::Full(len) => {
                        body.extend_from_slice(take(data, &mut pos, len)?);
                        break;
                    }
                    BodyLength::Partial(len) => {
                        body.extend_from_slice(take(data, &mut pos, len)?);
                    }
                }
            }
            out.push(Packet { tag, body });
        } else {
            let tag = (header >> 2) & 0x0f;
            let len = match header & 0x03 {
                0 => read_be(data, &mut pos, 1)?,
                1 => read_be(data, &mut pos, 2)?,
                2 => read_be(data, &mut pos, 4)?,
                _ => data.len() - pos,
            };
            let body = take(data, &mut pos, len)?.to_vec();
            out.push(Packet { tag, body });
        }
    }
    Ok(out)
}

enum BodyLength {
    Full(usize),
    Partial(usize),
}

fn read_new_length(data: &[u8], pos: &mut usize) -> Result<BodyLength> {
    let first = read_be(data, pos, 1)?;
    match first {
        0..=191 => Ok(BodyLength::Full(first)),
        192..=223 => {
            let second = read_be(data, pos, 1)?;
            Ok(BodyLength::Full(((first - 192) << 8) + second + 192))
        }
        255 => Ok(BodyLength::Full(read_be(data, pos, 4)?)),
        _ => Ok(BodyLength::Partial(1usize << (first & 0x1f))),
    }
}

fn read_be(data: &[u8], pos: &mut usize, width: usize) -> Result<usize> {
    let bytes = take(data, pos, width)?;
    Ok(bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| anyhow!("truncated packet at offset {}", pos))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Decodes an ASCII-armored block into binary. The CRC24 line is checked
/// when present.
pub fn dearmor(text: &str) -> Result<Vec<u8>> {
    let mut lines = text.lines().map(str::trim);
    lines
        .by_ref()
        .find(|line| line.starts_with("-----BEGIN PGP"))
        .ok_or_else(|| anyhow!("missing armor header line"))?;

    let mut payload = String::new();
    let mut checksum: Option<&str> = None;
    let mut ended = false;
    for line in lines {
        if line.starts_with("-----END PGP") {
            ended = true;
            break;
        }
        if line.is_empty() {
            continue;
        }
        // Armor headers ("Version: ...", "Comment: ...") precede the payload.
        if payload.is_empty() && line.contains(": ") {
            continue;
        }
        if line.len() == 5 && line.starts_with('=') {
            checksum = Some(&line[1..]);
            continue;
        }
        payload.push_str(line);
    }
    if !ended {
        return Err(anyhow!("missing armor tail line"));
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let data = engine
        .decode(payload.as_bytes())
        .map_err(|e| anyhow!("invalid armor payload: {}", e))?;
    if let Some(expected) = checksum {
        let expected = engine
            .decode(expected.as_bytes())
            .map_err(|e| anyhow!("invalid armor checksum: {}", e))?;
        let actual = crc24(&data).to_be_bytes();
        if expected.as_slice() != &actual[1..] {
            return Err(anyhow!("armor checksum mismatch"));
        }
    }
    Ok(data)
}

fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

/// Pulls the mail address out of a user id such as
/// `Alice Doe (ops) <alice@example.com>`.
pub fn extract_email(user_id: &str) -> Option<String> {
    static BRACKETED: OnceLock<regex::Regex> = OnceLock::new();
    static BARE: OnceLock<regex::Regex> = OnceLock::new();
    let bracketed =
        BRACKETED.get_or_init(|| regex::Regex::new(r"<([^<>\s@]+@[^<>\s@]+)>").unwrap());
    let bare = BARE.get_or_init(|| regex::Regex::new(r"^[^<>\s@]+@[^<>\s@]+$").unwrap());

    if let Some(caps) = bracketed.captures_iter(user_id).last() {
        return Some(caps[1].to_string());
    }
    let trimmed = user_id.trim();
    if bare.is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    None
}

/// Builds an old-format packet. Only used to assemble fixtures.
#[cfg(test)]
pub(crate) fn encode_packet(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    if body.len() < 256 {
        out.push(0x80 | (tag << 2));
        out.push(body.len() as u8);
    } else {
        out.push(0x80 | (tag << 2) | 1);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(body);
    out
}

/// A V4 public key packet followed by one user id packet per entry.
#[cfg(test)]
pub(crate) fn test_key(seed: u8, user_ids: &[&str]) -> Vec<u8> {
    let mut primary = vec![4u8, 0, 0, 0, seed, 22];
    primary.extend_from_slice(&[seed; 32]);
    let mut out = encode_packet(TAG_PUBLIC_KEY, &primary);
    for uid in user_ids {
        out.extend(encode_packet(TAG_USER_ID, uid.as_bytes()));
    }
    out
}

#[cfg(test)]
pub(crate) fn armor(data: &[u8]) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    let body = engine.encode(data);
    let crc = crc24(data).to_be_bytes();
    let mut out = String::from("-----BEGIN PGP PUBLIC KEY BLOCK-----\nComment: fixture\n\n");
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push('=');
    out.push_str(&engine.encode(&crc[1..]));
    out.push_str("\n-----END PGP PUBLIC KEY BLOCK-----\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_every_address_from_user_ids() {
        let data = test_key(
            1,
            &[
                "Alice Doe <alice@example.com>",
                "Alice (work) <alice@corp.example>",
                "no address here",
            ],
        );
        let key = PublicKey::parse(&data).unwrap();
        assert_eq!(key.identities().len(), 3);
        assert_eq!(key.emails(), vec!["alice@example.com", "alice@corp.example"]);
        assert_eq!(key.identities()[2].email, None);
    }

    #[test]
    fn stops_at_the_next_primary_key() {
        let mut data = test_key(1, &["a <a@x.com>"]);
        data.extend(test_key(2, &["b <b@x.com>"]));
        let key = PublicKey::parse(&data).unwrap();
        assert_eq!(key.emails(), vec!["a@x.com"]);
    }

    #[test]
    fn duplicate_addresses_collapse() {
        let data = test_key(3, &["A <a@x.com>", "A again <A@X.com>"]);
        let key = PublicKey::parse(&data).unwrap();
        assert_eq!(key.emails(), vec!["a@x.com"]);
    }

    #[test]
    fn rejects_material_that_does_not_start_with_a_key() {
        let data = encode_packet(TAG_USER_ID, b"a <a@x.com>");
        assert!(PublicKey::parse(&data).is_err());
        assert!(PublicKey::parse(&[]).is_err());
        assert!(PublicKey::parse(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn truncated_packet_is_an_error() {
        let mut data = test_key(4, &["a <a@x.com>"]);
        data.truncate(data.len() - 3);
        assert!(parse_packets(&data).is_err());
    }

    #[test]
    fn new_format_lengths_and_partial_bodies() {
        // Two-octet length: 200 byte body.
        let mut data = vec![0xC0 | TAG_USER_ID, 192, 8];
        data.extend(std::iter::repeat(b'a').take(200));
        // Partial body of 2 bytes followed by a final 1 byte chunk.
        data.extend_from_slice(&[0xC0 | TAG_USER_ID, 0xE1, b'x', b'y', 1, b'z']);
        let packets = parse_packets(&data).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].body.len(), 200);
        assert_eq!(packets[1].body, b"xyz");
    }

    #[test]
    fn fingerprint_is_sha1_over_prefixed_primary_packet() {
        let key = PublicKey::parse(&test_key(5, &[])).unwrap();
        let fp = key.fingerprint().unwrap();
        assert_eq!(fp.len(), 40);
        assert_eq!(fp, fp.to_lowercase());
        let other = PublicKey::parse(&test_key(6, &[])).unwrap();
        assert_ne!(other.fingerprint().unwrap(), fp);
    }

    #[test]
    fn armor_round_trip_checks_crc() {
        let data = test_key(7, &["a <a@x.com>"]);
        let text = armor(&data);
        assert_eq!(dearmor(&text).unwrap(), data);

        let crc_line = text.lines().find(|l| l.starts_with('=')).unwrap();
        assert_ne!(crc_line, "=AAAA");
        let broken = text.replace(crc_line, "=AAAA");
        assert!(dearmor(&broken).is_err());
    }

    #[test]
    fn dearmor_requires_both_armor_lines() {
        assert!(dearmor("not a key").is_err());
        assert!(dearmor("-----BEGIN PGP PUBLIC KEY BLOCK-----\n\nAAAA\n").is_err());
    }

    #[test]
    fn email_extraction_forms() {
        assert_eq!(extract_email("bob@x.com"), Some("bob@x.com".to_string()));
        assert_eq!(
            extract_email("Bob <bob@x.com>"),
            Some("bob@x.com".to_string())
        );
        assert_eq!(extract_email("Bob"), None);
        assert_eq!(extract_email("<not-an-address>"), None);
    }
}
