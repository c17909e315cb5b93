//! The per-peer acknowledgement bookkeeping: one table for reliable packets
//!  this side sent and still awaits acks for, one for reliable sequence
//!  numbers this side received and still owes acks for.

use crate::packet::SequenceNumber;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Notification that an inbound ack retired a reliable packet. `sent_at` is
///  the time of the most recent transmission, so `now - sent_at` is a round
///  trip sample when the caller knows the packet was answered promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedPacket {
    pub sequence: SequenceNumber,
    pub sent_at: Instant,
}

struct SentEntry {
    sent_at: Instant,
    datagram: Vec<u8>,
}

/// Reliable packets sent and not yet acknowledged, keyed by sequence number.
///  Entries keep a clone of the serialized datagram so retransmissions are
///  byte-identical to the original, sequence number and piggybacked acks
///  included.
pub struct SentAwaitingAck {
    entries: BTreeMap<SequenceNumber, SentEntry>,
}

impl SentAwaitingAck {
    pub fn new() -> SentAwaitingAck {
        SentAwaitingAck { entries: BTreeMap::new() }
    }

    /// Stores a freshly sent packet. Duplicate sequence numbers are rejected:
    ///  sequence numbers are assigned strictly increasing, so a second add
    ///  for the same number is a caller bug, not a wire condition.
    pub fn add(&mut self, sequence: SequenceNumber, datagram: Vec<u8>, now: Instant) -> bool {
        if self.entries.contains_key(&sequence) {
            debug!("not storing duplicate sequence number {} for resending", sequence);
            return false;
        }
        self.entries.insert(sequence, SentEntry { sent_at: now, datagram });
        true
    }

    /// Removes every entry whose sequence number appears in an inbound ack
    ///  list, returning one [`AckedPacket`] notification per removed entry.
    pub fn ingest_acks(&mut self, acks: &[SequenceNumber]) -> Vec<AckedPacket> {
        let mut retired = Vec::new();
        for ack in acks {
            if let Some(entry) = self.entries.remove(ack) {
                trace!("sequence number {} acked", ack);
                retired.push(AckedPacket { sequence: *ack, sent_at: entry.sent_at });
            }
        }
        retired
    }

    /// Clones of all packets whose last transmission is older than the resend
    ///  budget.
    pub fn due_for_resend(&self, now: Instant, resend_budget: Duration) -> Vec<(SequenceNumber, Vec<u8>)> {
        self.entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= resend_budget)
            .map(|(&sequence, entry)| (sequence, entry.datagram.clone()))
            .collect()
    }

    /// Refreshes the send timestamp after a retransmission. Retransmissions
    ///  never re-number: the stored datagram goes out unchanged.
    pub fn mark_resent(&mut self, sequence: SequenceNumber, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            entry.sent_at = now;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recently received reliable sequence numbers, waiting to be acknowledged.
///  Bounded: when a newly recorded number pushes the size past the capacity,
///  the lowest number is evicted. Every outgoing packet copies the current
///  contents into its header, so each number is acknowledged repeatedly until
///  it ages out - lost acks are covered by the next outbound packet.
pub struct RecentReceivedToAck {
    capacity: usize,
    sequences: BTreeSet<SequenceNumber>,
}

impl RecentReceivedToAck {
    pub fn new(capacity: usize) -> RecentReceivedToAck {
        RecentReceivedToAck { capacity, sequences: BTreeSet::new() }
    }

    /// Records an inbound reliable sequence number. Returns `false` if the
    ///  number is already present - the packet is a retransmission whose ack
    ///  got lost, to be re-acknowledged but not delivered again.
    pub fn record(&mut self, sequence: SequenceNumber) -> bool {
        if !self.sequences.insert(sequence) {
            return false;
        }
        while self.sequences.len() > self.capacity {
            self.sequences.pop_first();
        }
        true
    }

    /// The current ack list, most recent first.
    pub fn next_acks(&self) -> Vec<SequenceNumber> {
        self.sequences.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(raw: u64) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn seqs(raw: &[u64]) -> Vec<SequenceNumber> {
        raw.iter().cloned().map(SequenceNumber::from_raw).collect()
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let now = Instant::now();
        let mut table = SentAwaitingAck::new();

        assert!(table.add(seq(1), vec![1], now));
        assert!(!table.add(seq(1), vec![2], now));
        assert_eq!(table.len(), 1);
    }

    #[rstest]
    #[case::no_match(vec![1, 2, 3], vec![9], vec![], 3)]
    #[case::one_match(vec![1, 2, 3], vec![2], vec![2], 2)]
    #[case::all_match(vec![1, 2, 3], vec![3, 2, 1], vec![3, 2, 1], 0)]
    #[case::repeated_ack(vec![1, 2], vec![1, 1], vec![1], 1)]
    #[case::empty_table(vec![], vec![1, 2], vec![], 0)]
    fn test_ingest_acks(
        #[case] stored: Vec<u64>,
        #[case] acks: Vec<u64>,
        #[case] expected_retired: Vec<u64>,
        #[case] expected_remaining: usize,
    ) {
        let now = Instant::now();
        let mut table = SentAwaitingAck::new();
        for s in stored {
            table.add(seq(s), vec![s as u8], now);
        }

        let retired: Vec<u64> = table
            .ingest_acks(&seqs(&acks))
            .into_iter()
            .map(|a| a.sequence.to_raw())
            .collect();

        assert_eq!(retired, expected_retired);
        assert_eq!(table.len(), expected_remaining);
    }

    #[test]
    fn test_due_for_resend_honors_budget() {
        let base = Instant::now();
        let budget = Duration::from_millis(1000);
        let mut table = SentAwaitingAck::new();

        table.add(seq(1), vec![1], base);
        table.add(seq(2), vec![2], base + Duration::from_millis(600));

        let due: Vec<u64> = table
            .due_for_resend(base + Duration::from_millis(1100), budget)
            .into_iter()
            .map(|(s, _)| s.to_raw())
            .collect();
        assert_eq!(due, vec![1]);

        let due: Vec<u64> = table
            .due_for_resend(base + Duration::from_millis(1700), budget)
            .into_iter()
            .map(|(s, _)| s.to_raw())
            .collect();
        assert_eq!(due, vec![1, 2]);
    }

    #[test]
    fn test_mark_resent_defers_next_resend() {
        let base = Instant::now();
        let budget = Duration::from_millis(1000);
        let mut table = SentAwaitingAck::new();
        table.add(seq(1), vec![1], base);

        table.mark_resent(seq(1), base + Duration::from_millis(1000));

        assert!(table.due_for_resend(base + Duration::from_millis(1500), budget).is_empty());
        assert_eq!(table.due_for_resend(base + Duration::from_millis(2000), budget).len(), 1);
    }

    #[test]
    fn test_resent_datagram_is_byte_identical() {
        let now = Instant::now();
        let mut table = SentAwaitingAck::new();
        table.add(seq(7), vec![0xab, 0xcd], now);

        let due = table.due_for_resend(now + Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(due, vec![(seq(7), vec![0xab, 0xcd])]);
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![5], vec![5])]
    #[case::most_recent_first(vec![3, 7, 5], vec![7, 5, 3])]
    fn test_next_acks_order(#[case] recorded: Vec<u64>, #[case] expected: Vec<u64>) {
        let mut table = RecentReceivedToAck::new(32);
        for s in recorded {
            table.record(seq(s));
        }

        let acks: Vec<u64> = table.next_acks().into_iter().map(|s| s.to_raw()).collect();
        assert_eq!(acks, expected);
    }

    #[test]
    fn test_record_detects_duplicates() {
        let mut table = RecentReceivedToAck::new(32);
        assert!(table.record(seq(4)));
        assert!(!table.record(seq(4)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_lowest() {
        let mut table = RecentReceivedToAck::new(32);
        for s in 1..=40u64 {
            table.record(seq(s));
        }

        assert_eq!(table.len(), 32);
        let acks = table.next_acks();
        assert_eq!(acks.first().map(|s| s.to_raw()), Some(40));
        assert_eq!(acks.last().map(|s| s.to_raw()), Some(9));

        // an evicted number is no longer recognized as a duplicate
        assert!(table.record(seq(3)));
    }
}
