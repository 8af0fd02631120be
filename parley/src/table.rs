//! The shared flow table: the single source of truth for per-flow state.
//!
//! ### Concurrency model
//!
//! Input, capture and timeout workers all reach into the table, but only
//! ever mutate a flow while holding its `processing` claim:
//!
//! - `claim` is a check-and-set on the claim bit under the map's shard
//!   lock; losers re-enqueue their event at the back of its channel
//!   instead of blocking, so head-of-line blocking cannot occur.
//! - `release` clears the bit and is idempotent.
//! - Accessors take the shard lock only for the duration of one read or
//!   one field write; no reference escapes the lock.

use std::sync::Arc;

use dashmap::DashMap;
use fxhash::FxBuildHasher;
use tracing::debug;

use crate::packet::{ExpectedNext, FlowKey, SegmentRecord};

struct FlowEntry {
    packet: SegmentRecord,
    handshake_index: usize,
    ack_reached: bool,
    data_reached: bool,
    hyperacktive: bool,
    ephemeral_resp_count: u32,
    parent_port: u16,
    processing: bool,
}

impl FlowEntry {
    fn new(packet: SegmentRecord) -> FlowEntry {
        FlowEntry {
            packet,
            handshake_index: 0,
            ack_reached: false,
            data_reached: false,
            hyperacktive: false,
            ephemeral_resp_count: 0,
            parent_port: 0,
            processing: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct FlowTable {
    map: Arc<DashMap<FlowKey, FlowEntry, FxBuildHasher>>,
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable {
            map: Arc::new(DashMap::with_hasher(FxBuildHasher::default())),
        }
    }

    /// Returns `(present, acquired)`: whether the key exists and, if so,
    /// whether the caller is now the sole writer.
    pub fn claim(&self, key: FlowKey) -> (bool, bool) {
        match self.map.get_mut(&key) {
            None => (false, false),
            Some(mut entry) => {
                if entry.processing {
                    (true, false)
                } else {
                    entry.processing = true;
                    (true, true)
                }
            }
        }
    }

    /// Clears the claim bit. Safe to call on a key that is gone or was
    /// never claimed by the caller.
    pub fn release(&self, key: FlowKey) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.processing = false;
        }
    }

    /// Creates the flow with defaults (claim held by the creator) or
    /// replaces an existing flow's last-packet record.
    pub fn insert_or_update(&self, key: FlowKey, packet: SegmentRecord) {
        match self.map.get_mut(&key) {
            Some(mut entry) => entry.packet = packet,
            None => {
                self.map.insert(key, FlowEntry::new(packet));
            }
        }
    }

    /// Removes the flow, returning its final record.
    pub fn remove(&self, key: FlowKey) -> Option<SegmentRecord> {
        self.map.remove(&key).map(|(_, entry)| entry.packet)
    }

    pub fn contains(&self, key: FlowKey) -> bool {
        self.map.contains_key(&key)
    }

    /// Clone of the flow's last-packet record.
    pub fn get_packet(&self, key: FlowKey) -> Option<SegmentRecord> {
        self.map.get(&key).map(|entry| entry.packet.clone())
    }

    /// `Some(inner)` when the flow exists; `inner` is its current
    /// expected-next marker. The timer pollers use this to detect
    /// progress since enqueue.
    pub fn expected_next(&self, key: FlowKey) -> Option<Option<ExpectedNext>> {
        self.map.get(&key).map(|entry| entry.packet.expected_next)
    }

    pub fn count(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn handshake_index(&self, key: FlowKey) -> Option<usize> {
        self.map.get(&key).map(|entry| entry.handshake_index)
    }

    pub fn increment_handshake(&self, key: FlowKey) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.handshake_index += 1;
        }
    }

    /// Bumps the stored record's retry counter, returning the new value.
    pub fn increment_retries(&self, key: FlowKey) -> u32 {
        match self.map.get_mut(&key) {
            Some(mut entry) => {
                entry.packet.retries += 1;
                entry.packet.retries
            }
            None => 0,
        }
    }

    pub fn set_ack_reached(&self, key: FlowKey) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.ack_reached = true;
        }
    }

    pub fn ack_reached(&self, key: FlowKey) -> bool {
        self.map.get(&key).map(|e| e.ack_reached).unwrap_or(false)
    }

    pub fn set_data_reached(&self, key: FlowKey) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.data_reached = true;
        }
    }

    pub fn data_reached(&self, key: FlowKey) -> bool {
        self.map.get(&key).map(|e| e.data_reached).unwrap_or(false)
    }

    pub fn set_hyperacktive(&self, key: FlowKey) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.hyperacktive = true;
        }
    }

    pub fn is_hyperacktive(&self, key: FlowKey) -> bool {
        self.map.get(&key).map(|e| e.hyperacktive).unwrap_or(false)
    }

    pub fn set_parent_port(&self, key: FlowKey, port: u16) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.parent_port = port;
        }
    }

    pub fn parent_port(&self, key: FlowKey) -> u16 {
        self.map.get(&key).map(|e| e.parent_port).unwrap_or(0)
    }

    /// Bumps the ephemeral-response counter on the parent flow a sibling
    /// probe reports to.
    pub fn increment_ephemeral_resp(&self, parent_key: FlowKey) {
        if let Some(mut entry) = self.map.get_mut(&parent_key) {
            entry.ephemeral_resp_count += 1;
        }
    }

    pub fn ephemeral_resp_count(&self, key: FlowKey) -> u32 {
        self.map
            .get(&key)
            .map(|e| e.ephemeral_resp_count)
            .unwrap_or(0)
    }

    /// Pairs a captured segment with its tracked flow. True only when the
    /// key matches, the wire destination port matches the flow's last
    /// local port, and the sequence/acknowledgment numbers line up with
    /// what we last sent.
    pub fn verify_segment(&self, recv: &SegmentRecord) -> bool {
        let Some(entry) = self.map.get(&recv.key()) else {
            return false;
        };
        let stored = &entry.packet;

        if stored.remote_ip == recv.remote_ip
            && stored.local_port == recv.local_port
            && stored.remote_port == recv.remote_port
            && reply_matches(stored, recv)
        {
            return true;
        }

        debug!(
            remote = %recv.remote_ip,
            recv_seq = recv.seq,
            stored_seq = stored.seq,
            recv_ack = recv.ack,
            stored_ack = stored.ack,
            recv_len = recv.payload.len(),
            stored_response_len = stored.response_len,
            "segment failed flow validation"
        );
        false
    }
}

/// Sequence/acknowledgment agreement between the stored record and a
/// received segment.
///
/// A SYN-ACK answers the SYN we copied the stored seq onto, so its ack
/// must be `stored.seq + 1`. Anything else must carry the seq we already
/// know (exactly, or +1) and either acknowledge our last payload
/// byte-accurately or be an RST (ack 0).
fn reply_matches(stored: &SegmentRecord, recv: &SegmentRecord) -> bool {
    if recv.is_syn() && recv.is_ack() {
        return recv.ack == stored.seq.wrapping_add(1);
    }
    if recv.seq == stored.seq || recv.seq == stored.seq.wrapping_add(1) {
        if recv.ack == stored.ack.wrapping_add(stored.response_len as u32) {
            return true;
        }
        if recv.ack == 0 {
            // RSTs
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use parley_wire::tcp::{TCP_FLAG_ACK, TCP_FLAG_RST, TCP_FLAG_SYN};

    fn record(remote_port: u16) -> SegmentRecord {
        let line = format!(
            r#"{{"saddr":"10.0.0.1","sport":{remote_port},"daddr":"10.0.0.2","dport":40000,"seqnum":1000,"acknum":2000,"window":65535}}"#
        );
        SegmentRecord::from_prober_line(&line).unwrap()
    }

    fn key() -> FlowKey {
        (Ipv4Addr::new(10, 0, 0, 1), 80)
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let table = FlowTable::new();
        assert_eq!(table.claim(key()), (false, false));

        table.insert_or_update(key(), record(80));
        // Creator holds the claim.
        assert_eq!(table.claim(key()), (true, false));

        table.release(key());
        assert_eq!(table.claim(key()), (true, true));
        assert_eq!(table.claim(key()), (true, false));

        table.release(key());
        table.release(key()); // idempotent
        assert_eq!(table.claim(key()), (true, true));
    }

    #[test]
    fn update_replaces_packet_and_keeps_flags() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));
        table.set_ack_reached(key());
        table.increment_handshake(key());

        let mut replacement = record(80);
        replacement.seq = 7777;
        table.insert_or_update(key(), replacement);

        assert_eq!(table.get_packet(key()).unwrap().seq, 7777);
        assert!(table.ack_reached(key()));
        assert_eq!(table.handshake_index(key()), Some(1));
    }

    #[test]
    fn remove_returns_final_record() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));
        assert_eq!(table.count(), 1);

        let rec = table.remove(key()).unwrap();
        assert_eq!(rec.remote_port, 80);
        assert!(table.is_empty());
        assert!(table.remove(key()).is_none());
    }

    #[test]
    fn ephemeral_counter_targets_parent_key() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));
        let sibling_key = (Ipv4Addr::new(10, 0, 0, 1), 50555);

        table.increment_ephemeral_resp(key());
        table.increment_ephemeral_resp(key());
        assert_eq!(table.ephemeral_resp_count(key()), 2);
        assert_eq!(table.ephemeral_resp_count(sibling_key), 0);
    }

    #[test]
    fn synack_validation_needs_ack_of_our_seq() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));

        let mut synack = record(80);
        synack.flags = TCP_FLAG_SYN | TCP_FLAG_ACK;
        synack.ack = 1001; // stored.seq + 1
        assert!(table.verify_segment(&synack));

        synack.ack = 1002;
        assert!(!table.verify_segment(&synack));
    }

    #[test]
    fn data_validation_is_byte_accurate() {
        let table = FlowTable::new();
        let mut stored = record(80);
        stored.response_len = 120;
        table.insert_or_update(key(), stored);

        let mut reply = record(80);
        reply.flags = TCP_FLAG_ACK;
        reply.seq = 1000;
        reply.ack = 2120; // stored.ack + response_len
        assert!(table.verify_segment(&reply));

        reply.ack = 2119;
        assert!(!table.verify_segment(&reply));

        // seq one past the stored value is still ours
        reply.seq = 1001;
        reply.ack = 2120;
        assert!(table.verify_segment(&reply));

        reply.seq = 1002;
        assert!(!table.verify_segment(&reply));
    }

    #[test]
    fn rst_with_zero_ack_validates() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));

        let mut rst = record(80);
        rst.flags = TCP_FLAG_RST;
        rst.seq = 1000;
        rst.ack = 0;
        assert!(table.verify_segment(&rst));
    }

    #[test]
    fn wrong_local_port_fails_validation() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));

        let mut reply = record(80);
        reply.flags = TCP_FLAG_SYN | TCP_FLAG_ACK;
        reply.ack = 1001;
        reply.local_port = 40001;
        assert!(!table.verify_segment(&reply));
    }

    #[test]
    fn concurrent_claims_admit_one_winner() {
        let table = FlowTable::new();
        table.insert_or_update(key(), record(80));
        table.release(key());

        let table = std::sync::Arc::new(table);
        let mut handles = Vec::new();
        let winners = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..8 {
            let table = table.clone();
            let winners = winners.clone();
            handles.push(std::thread::spawn(move || {
                let (present, acquired) = table.claim(key());
                assert!(present);
                if acquired {
                    winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
