//! Pluggable application-layer probes and banner fingerprinting.
//!
//! A handshake is a pair of operations: the bytes to send once the TCP
//! handshake completes, and a classifier that inspects whatever comes
//! back. Every registered classifier runs against every response — hosts
//! routinely answer a probe for one protocol with a banner for another,
//! which is exactly the signal this engine exists to collect.

use std::collections::HashMap;

use dashmap::DashMap;
use fxhash::FxBuildHasher;

pub mod http;
pub mod tls;

/// One application-layer probe. Implementations must be deterministic for
/// a given target; anything template-based should build the template once
/// and clone per call.
pub trait Handshake: Send + Sync {
    /// First application-layer message to send, given the target address
    /// literal.
    fn probe(&self, target: &str) -> Vec<u8>;

    /// Names the protocol the response looks like, if any.
    fn classify(&self, data: &[u8]) -> Option<&'static str>;
}

/// Process-wide probe registry plus the running fingerprint histogram.
/// Built before the dispatcher starts and append-only afterwards.
pub struct HandshakeRegistry {
    probes: Vec<(String, Box<dyn Handshake>)>,
    index: HashMap<String, usize>,
    histogram: DashMap<String, u64, FxBuildHasher>,
}

impl HandshakeRegistry {
    /// Registry with the built-in `http` and `tls` probes.
    pub fn builtin() -> HandshakeRegistry {
        let mut registry = HandshakeRegistry {
            probes: Vec::new(),
            index: HashMap::new(),
            histogram: DashMap::with_hasher(FxBuildHasher::default()),
        };
        registry.register("http", Box::new(http::HttpHandshake));
        registry.register("tls", Box::new(tls::TlsHandshake));
        registry
    }

    pub fn register(&mut self, name: &str, handshake: Box<dyn Handshake>) {
        self.index.insert(name.to_string(), self.probes.len());
        self.probes.push((name.to_string(), handshake));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Handshake> {
        self.index.get(name).map(|&i| self.probes[i].1.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Runs every classifier over the response, joins multiple matches
    /// with `-`, reduces to a single tag and records it in the histogram.
    /// No match at all becomes `unknown`.
    pub fn fingerprint(&self, data: &[u8], priority: &[String]) -> String {
        let mut joined = String::new();
        let mut multi = false;
        for (_, handshake) in &self.probes {
            if let Some(tag) = handshake.classify(data) {
                if !joined.is_empty() {
                    multi = true;
                    joined.push('-');
                }
                joined.push_str(tag);
            }
        }

        let tag = if multi {
            reduce(&joined, priority)
        } else if joined.is_empty() {
            "unknown".to_string()
        } else {
            joined
        };

        *self
            .histogram
            .entry(tag.clone())
            .or_insert(0) += 1;
        tag
    }

    /// Snapshot of the tag histogram, sorted by descending count.
    pub fn histogram(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .histogram
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }
}

/// Picks one tag out of a multi-tag match: the configured priority list
/// first, then hard-coded precedence for combinations that show up in
/// practice.
pub(crate) fn reduce(joined: &str, priority: &[String]) -> String {
    for name in priority {
        if joined.contains(name.as_str()) {
            return name.clone();
        }
    }

    if joined.contains("ipp") {
        "ipp".to_string()
    } else if joined.contains("kubernetes") {
        "kubernetes".to_string()
    } else if joined.contains("dns") && joined.contains("http") {
        "http".to_string()
    } else if joined.contains("ssh") && joined.contains("http") {
        "http".to_string()
    } else if joined.contains("ftp") && joined.contains("http") {
        "http".to_string()
    } else if joined.contains("ftp") && joined.contains("ssh") {
        "ssh".to_string()
    } else if joined.contains("tls") && joined.contains("http") {
        // usually TLS answering with an HTTPS error page
        "tls".to_string()
    } else {
        joined.to_string()
    }
}
