//! TLS ClientHello probe and ServerHello/record-layer fingerprinting.
//!
//! The hello is a fixed template resembling a mainstream browser hello
//! (no GREASE, no SNI since targets are bare addresses), built once and
//! cloned per call. Classification is byte-pattern only: record type,
//! record-layer version, the supported_versions extension and ALPN.

use std::sync::OnceLock;

use super::Handshake;

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
const CONTENT_ALERT: u8 = 0x15;
const CONTENT_HANDSHAKE: u8 = 0x16;
const CONTENT_APPLICATION_DATA: u8 = 0x17;

pub struct TlsHandshake;

impl Handshake for TlsHandshake {
    fn probe(&self, _target: &str) -> Vec<u8> {
        static TEMPLATE: OnceLock<Vec<u8>> = OnceLock::new();
        TEMPLATE.get_or_init(build_client_hello).clone()
    }

    fn classify(&self, data: &[u8]) -> Option<&'static str> {
        if data.len() < 10 {
            return None;
        }

        // TLS ports often answer a malformed hello with a plain HTTP
        // error; surface that as http.
        if &data[0..4] == b"HTTP" {
            return Some("http");
        }

        match data[0] {
            CONTENT_HANDSHAKE | CONTENT_CHANGE_CIPHER_SPEC | CONTENT_ALERT
            | CONTENT_APPLICATION_DATA => {}
            _ => return None,
        }

        // supported_versions announcing 1.3 beats the record-layer
        // version, which stays at 1.2 for middlebox compatibility. ALPN
        // is encrypted in a 1.3 ServerHello, so 1.3 is final.
        if contains(data, &[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]) {
            return Some("tls1.3");
        }

        let version = match &data[1..3] {
            [0x03, 0x03] => "tls1.2",
            [0x03, 0x02] => "tls1.1",
            [0x03, 0x01] => "tls1.0",
            [0x03, 0x00] => "ssl3.0",
            _ => return Some("tls"),
        };

        // ALPN: length-prefixed protocol names inside the extension.
        if contains(data, b"\x08http/1.1") {
            Some("https")
        } else if contains(data, b"\x02h2") {
            Some("http2")
        } else if contains(data, b"\x03h2c") {
            Some("http2tcp")
        } else {
            Some(version)
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Assembles the ClientHello template. Length fields are backfilled once
/// the body is complete.
fn build_client_hello() -> Vec<u8> {
    let mut body = Vec::with_capacity(256);

    // client_version: TLS 1.2 at the legacy position
    body.extend_from_slice(&[0x03, 0x03]);

    // client random: fixed bytes; two of them are rewritten to CRLF below
    // so HTTP servers answer the garbled request with a fingerprintable
    // 400 instead of hanging.
    for i in 0..32u8 {
        body.push(i.wrapping_mul(7).wrapping_add(13));
    }

    // legacy session id, 32 bytes
    body.push(32);
    for i in 0..32u8 {
        body.push(i.wrapping_mul(11).wrapping_add(5));
    }

    // cipher suites
    let suites: [u16; 15] = [
        0x1301, 0x1302, 0x1303, // TLS 1.3
        0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f,
        0x0035,
    ];
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for suite in suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }

    // compression methods: null only
    body.extend_from_slice(&[0x01, 0x00]);

    // extensions
    let mut ext = Vec::with_capacity(128);
    push_extension(&mut ext, 0x000a, &{
        // supported_groups: x25519, secp256r1, secp384r1
        let mut b = vec![0x00, 0x06];
        b.extend_from_slice(&[0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]);
        b
    });
    push_extension(&mut ext, 0x000b, &[0x01, 0x00]); // ec_point_formats: uncompressed
    push_extension(&mut ext, 0x000d, &{
        // signature_algorithms
        let algs: [u16; 8] = [
            0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
        ];
        let mut b = ((algs.len() * 2) as u16).to_be_bytes().to_vec();
        for alg in algs {
            b.extend_from_slice(&alg.to_be_bytes());
        }
        b
    });
    push_extension(&mut ext, 0x0010, &{
        // ALPN: h2, http/1.1
        let mut names = Vec::new();
        names.push(2);
        names.extend_from_slice(b"h2");
        names.push(8);
        names.extend_from_slice(b"http/1.1");
        let mut b = (names.len() as u16).to_be_bytes().to_vec();
        b.extend_from_slice(&names);
        b
    });
    push_extension(&mut ext, 0x0023, &[]); // session_ticket
    push_extension(&mut ext, 0x0017, &[]); // extended_master_secret
    push_extension(&mut ext, 0x002b, &[0x04, 0x03, 0x04, 0x03, 0x03]); // supported_versions: 1.3, 1.2
    push_extension(&mut ext, 0x0033, &{
        // key_share: one x25519 entry with a fixed public key
        let mut share = vec![0x00, 0x1d, 0x00, 0x20];
        for i in 0..32u8 {
            share.push(i.wrapping_mul(3).wrapping_add(1));
        }
        let mut b = (share.len() as u16).to_be_bytes().to_vec();
        b.extend_from_slice(&share);
        b
    });

    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    // handshake header + record header
    let mut hello = Vec::with_capacity(body.len() + 9);
    hello.push(CONTENT_HANDSHAKE);
    hello.extend_from_slice(&[0x03, 0x01]); // record version: TLS 1.0
    hello.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    hello.push(0x01); // handshake type: client_hello
    hello.push(0x00);
    hello.extend_from_slice(&(body.len() as u16).to_be_bytes());
    hello.extend_from_slice(&body);

    // CRLF injection into the client random (absolute offsets 0x0f/0x10)
    hello[0x0f] = 0x0d;
    hello[0x10] = 0x0a;

    hello
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, payload: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_record_framing_is_consistent() {
        let hello = build_client_hello();
        assert_eq!(hello[0], CONTENT_HANDSHAKE);
        assert_eq!(&hello[1..3], &[0x03, 0x01]);

        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(record_len, hello.len() - 5);

        assert_eq!(hello[5], 0x01);
        let hs_len =
            u32::from_be_bytes([0, hello[6], hello[7], hello[8]]) as usize;
        assert_eq!(hs_len, hello.len() - 9);
    }

    #[test]
    fn hello_carries_crlf_in_random() {
        let hello = build_client_hello();
        assert_eq!(hello[0x0f], 0x0d);
        assert_eq!(hello[0x10], 0x0a);
    }

    #[test]
    fn probe_is_deterministic() {
        let h = TlsHandshake;
        assert_eq!(h.probe("10.0.0.1"), h.probe("192.168.1.1"));
    }

    #[test]
    fn classifies_tls13_by_supported_versions() {
        // minimal ServerHello-ish bytes: handshake record, 1.2 record
        // version, supported_versions extension announcing 1.3
        let mut data = vec![0x16, 0x03, 0x03, 0x00, 0x40, 0x02, 0x00, 0x00, 0x3c, 0x03, 0x03];
        data.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);
        assert_eq!(TlsHandshake.classify(&data), Some("tls1.3"));
    }

    #[test]
    fn classifies_record_layer_versions() {
        let h = TlsHandshake;
        assert_eq!(
            h.classify(&[0x16, 0x03, 0x03, 0, 0, 0, 0, 0, 0, 0]),
            Some("tls1.2")
        );
        assert_eq!(
            h.classify(&[0x16, 0x03, 0x01, 0, 0, 0, 0, 0, 0, 0]),
            Some("tls1.0")
        );
        assert_eq!(
            h.classify(&[0x15, 0x03, 0x00, 0, 0, 0, 0, 0, 0, 0]),
            Some("ssl3.0")
        );
    }

    #[test]
    fn alpn_refines_tls12() {
        let mut data = vec![0x16, 0x03, 0x03, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(b"\x08http/1.1");
        assert_eq!(TlsHandshake.classify(&data), Some("https"));

        let mut data = vec![0x16, 0x03, 0x03, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(b"\x02h2");
        assert_eq!(TlsHandshake.classify(&data), Some("http2"));
    }

    #[test]
    fn http_error_text_wins() {
        assert_eq!(
            TlsHandshake.classify(b"HTTP/1.1 400 Bad Request\r\n"),
            Some("http")
        );
    }

    #[test]
    fn non_tls_bytes_rejected() {
        assert_eq!(TlsHandshake.classify(b"SSH-2.0-OpenSSH_8.9\r\n"), None);
        assert_eq!(TlsHandshake.classify(b"x"), None);
    }
}
