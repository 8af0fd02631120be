//! Plain HTTP GET probe.

use super::Handshake;

const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Mobile Safari/537.36 Edg/114.0.1823.43";

pub struct HttpHandshake;

impl Handshake for HttpHandshake {
    fn probe(&self, target: &str) -> Vec<u8> {
        format!(
            "GET / HTTP/1.1\r\nHost: {target}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\nAccept-Encoding: gzip\r\n\r\n"
        )
        .into_bytes()
    }

    fn classify(&self, data: &[u8]) -> Option<&'static str> {
        let text = String::from_utf8_lossy(data);
        // "HTTPS" banners (e.g. plain-HTTP errors from TLS ports) are the
        // TLS classifier's business.
        if !text.contains("HTTPS")
            && (text.contains("HTTP")
                || text.contains("html")
                || text.contains("HTML")
                || text.contains("<h1>"))
        {
            return Some("http");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_a_complete_request() {
        let bytes = HttpHandshake.probe("10.0.0.1");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.1\r\n"));
        assert!(text.contains("Accept-Encoding: gzip\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn classifies_status_lines_and_markup() {
        let h = HttpHandshake;
        assert_eq!(h.classify(b"HTTP/1.1 200 OK\r\n"), Some("http"));
        assert_eq!(h.classify(b"<html><h1>It works!</h1></html>"), Some("http"));
        assert_eq!(h.classify(b"SSH-2.0-OpenSSH_8.9"), None);
    }

    #[test]
    fn https_banners_are_left_alone() {
        assert_eq!(
            HttpHandshake.classify(b"This is an HTTPS port, speak TLS"),
            None
        );
    }
}
