//! Deterministic ClientHello assembly.
//!
//! The byte layout follows the TLS 1.3 ClientHello as Chrome emits it. All
//! variable content except the 32-byte random comes straight from profile
//! data, so two handshakes with the same profile and random are
//! byte-identical. The JA3 helpers derive the textual fingerprint from the
//! same fields, with GREASE values stripped as JA3 requires.

use super::{FingerprintProfile, GREASE_CIPHER, GREASE_EXTENSION, GREASE_GROUP};

const TLS_1_0: u16 = 0x0301;
const TLS_1_2: u16 = 0x0303;
const TLS_1_3: u16 = 0x0304;

/// Build the ClientHello for `server_name` with fresh entropy.
pub fn client_hello(profile: &FingerprintProfile, server_name: &str) -> Vec<u8> {
    client_hello_with_random(profile, server_name, &rand::random::<[u8; 32]>())
}

/// Build the ClientHello with caller-supplied entropy.
///
/// The random field and the key-share material are both derived from
/// `random`, so golden-byte tests can pin the entire message.
pub fn client_hello_with_random(
    profile: &FingerprintProfile,
    server_name: &str,
    random: &[u8; 32],
) -> Vec<u8> {
    let mut hello = Vec::with_capacity(512);

    // Record header: handshake, legacy version, length placeholder.
    hello.push(0x16);
    push_u16(&mut hello, TLS_1_0);
    push_u16(&mut hello, 0);

    // Handshake header: client_hello, 24-bit length placeholder.
    hello.push(0x01);
    hello.extend_from_slice(&[0, 0, 0]);

    push_u16(&mut hello, TLS_1_2);
    hello.extend_from_slice(random);

    // Legacy session id: Chrome sends 32 bytes. Derived from the handshake
    // entropy so the assembly stays deterministic per random.
    hello.push(32);
    hello.extend_from_slice(random);

    push_u16(&mut hello, (profile.cipher_suites().len() * 2) as u16);
    for suite in profile.cipher_suites() {
        push_u16(&mut hello, *suite);
    }

    // Compression methods: null only.
    hello.push(0x01);
    hello.push(0x00);

    let extensions_start = hello.len();
    push_u16(&mut hello, 0);
    for extension in profile.extensions() {
        write_extension(&mut hello, profile, *extension, server_name, random);
    }
    let extensions_len = (hello.len() - extensions_start - 2) as u16;
    patch_u16(&mut hello, extensions_start, extensions_len);

    let handshake_len = (hello.len() - 9) as u32;
    hello[6] = (handshake_len >> 16) as u8;
    hello[7] = (handshake_len >> 8) as u8;
    hello[8] = handshake_len as u8;
    let record_len = (hello.len() - 5) as u16;
    patch_u16(&mut hello, 3, record_len);

    hello
}

fn write_extension(
    out: &mut Vec<u8>,
    profile: &FingerprintProfile,
    extension: u16,
    server_name: &str,
    random: &[u8; 32],
) {
    let payload = match extension {
        GREASE_EXTENSION => Vec::new(),
        // server_name
        0x0000 => {
            let name = server_name.as_bytes();
            let mut data = Vec::with_capacity(name.len() + 5);
            push_u16(&mut data, (name.len() + 3) as u16);
            data.push(0x00);
            push_u16(&mut data, name.len() as u16);
            data.extend_from_slice(name);
            data
        }
        // supported_groups
        0x000a => {
            let mut data = Vec::new();
            push_u16(&mut data, (profile.supported_groups().len() * 2) as u16);
            for group in profile.supported_groups() {
                push_u16(&mut data, *group);
            }
            data
        }
        // ec_point_formats
        0x000b => {
            let mut data = Vec::new();
            data.push(profile.ec_point_formats().len() as u8);
            data.extend_from_slice(profile.ec_point_formats());
            data
        }
        // signature_algorithms
        0x000d => {
            let mut data = Vec::new();
            push_u16(&mut data, (profile.signature_algorithms().len() * 2) as u16);
            for algorithm in profile.signature_algorithms() {
                push_u16(&mut data, *algorithm);
            }
            data
        }
        // application_layer_protocol_negotiation
        0x0010 => {
            let mut protocols = Vec::new();
            for protocol in profile.alpn() {
                protocols.push(protocol.len() as u8);
                protocols.extend_from_slice(protocol.as_bytes());
            }
            let mut data = Vec::with_capacity(protocols.len() + 2);
            push_u16(&mut data, protocols.len() as u16);
            data.extend_from_slice(&protocols);
            data
        }
        // supported_versions
        0x002b => {
            let versions = [TLS_1_3, TLS_1_2];
            let mut data = Vec::new();
            data.push((versions.len() * 2) as u8);
            for version in versions {
                push_u16(&mut data, version);
            }
            data
        }
        // psk_key_exchange_modes: psk_dhe_ke
        0x002d => vec![0x01, 0x01],
        // key_share: one entry per configured group, keyed off the handshake
        // entropy so the message stays deterministic per random.
        0x0033 => {
            let mut entries = Vec::new();
            for group in profile.key_share_groups() {
                push_u16(&mut entries, *group);
                push_u16(&mut entries, 32);
                entries.extend_from_slice(random);
            }
            let mut data = Vec::with_capacity(entries.len() + 2);
            push_u16(&mut data, entries.len() as u16);
            data.extend_from_slice(&entries);
            data
        }
        // session_ticket: empty unless the profile opts into resumption.
        0x0023 => Vec::new(),
        // compress_certificate: brotli
        0x001b => vec![0x02, 0x00, 0x02],
        // renegotiation_info
        0xff01 => vec![0x00],
        // status_request: OCSP
        0x0005 => vec![0x01, 0x00, 0x00, 0x00, 0x00],
        // padding: fixed-size block; Chrome pads to a bucket, profiles pin it.
        0x0015 => vec![0x00; 16],
        // extended_master_secret, signed_certificate_timestamp, and anything
        // else the profile lists without a payload.
        _ => Vec::new(),
    };

    push_u16(out, extension);
    push_u16(out, payload.len() as u16);
    out.extend_from_slice(&payload);
}

/// JA3 input string: version,ciphers,extensions,groups,point-formats.
/// GREASE values are excluded, matching how observers compute it.
pub fn ja3_string(profile: &FingerprintProfile) -> String {
    let ciphers = join_u16(profile.cipher_suites(), GREASE_CIPHER);
    let extensions = join_u16(profile.extensions(), GREASE_EXTENSION);
    let groups = join_u16(profile.supported_groups(), GREASE_GROUP);
    let formats = profile
        .ec_point_formats()
        .iter()
        .map(|format| format.to_string())
        .collect::<Vec<_>>()
        .join("-");

    format!("{TLS_1_2},{ciphers},{extensions},{groups},{formats}")
}

/// MD5 digest of the JA3 string, the form edges log and match on.
pub fn ja3_hash(profile: &FingerprintProfile) -> String {
    format!("{:x}", md5::compute(ja3_string(profile).as_bytes()))
}

fn join_u16(values: &[u16], grease: u16) -> String {
    values
        .iter()
        .filter(|value| **value != grease)
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.push((value >> 8) as u8);
    out.push(value as u8);
}

fn patch_u16(out: &mut [u8], index: usize, value: u16) {
    out[index] = (value >> 8) as u8;
    out[index + 1] = value as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::profile;

    #[test]
    fn deterministic_for_fixed_random() {
        let profile = profile("chrome-124").unwrap();
        let random = [7u8; 32];
        let first = client_hello_with_random(profile, "example.test", &random);
        let second = client_hello_with_random(profile, "example.test", &random);
        assert_eq!(first, second);
    }

    #[test]
    fn differs_only_in_entropy_derived_fields() {
        let profile = profile("chrome-124").unwrap();
        let a = client_hello_with_random(profile, "example.test", &[1u8; 32]);
        let b = client_hello_with_random(profile, "example.test", &[2u8; 32]);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn record_framing_is_consistent() {
        let profile = profile("chrome-124").unwrap();
        let hello = client_hello_with_random(profile, "example.test", &[0u8; 32]);

        assert_eq!(hello[0], 0x16);
        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(record_len, hello.len() - 5);
        assert_eq!(hello[5], 0x01);
        let handshake_len =
            u32::from_be_bytes([0, hello[6], hello[7], hello[8]]) as usize;
        assert_eq!(handshake_len, hello.len() - 9);
    }

    #[test]
    fn sni_carries_the_host() {
        let profile = profile("chrome-124").unwrap();
        let hello = client_hello_with_random(profile, "a.example.test", &[0u8; 32]);
        let needle = b"a.example.test";
        assert!(hello.windows(needle.len()).any(|window| window == needle));
    }

    #[test]
    fn ja3_excludes_grease() {
        let profile = profile("chrome-124").unwrap();
        let ja3 = ja3_string(profile);
        assert!(ja3.starts_with("771,4865-"));
        assert!(!ja3.contains(&GREASE_CIPHER.to_string()));
        assert_eq!(ja3_hash(profile).len(), 32);
    }
}
