//! The receive-side ordering filter: decides per inbound packet whether it is
//!  delivered or dropped, based on the channel's discipline and the peer's
//!  high-water mark of admitted sequence numbers.

use crate::channel::Channel;
use crate::packet::SequenceNumber;
use tracing::trace;

/// The filter's verdict for one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitVerdict {
    Admit,
    /// At or below the high-water mark: a duplicate or a late packet the
    ///  channel no longer wants. Reliable duplicates are re-acknowledged so
    ///  the sender stops retransmitting.
    DropStale,
    /// Beyond the next expected sequence number on the reliable-ordered
    ///  channel. Deliberately *not* acknowledged: the sender keeps
    ///  retransmitting until the gap before it has closed and the packet is
    ///  admitted in order.
    DropAhead,
}

/// Per-peer filter state. There is a single high-water mark rather than one
///  per channel: sequence numbers are assigned from one per-peer counter, so
///  admitted handshake, keep-alive and data traffic all advance the same
///  numbering. Strict `+1` admission on the reliable-ordered channel composes
///  with that counter exactly because every admitted packet moves the mark
///  past itself; a lost packet in between is either reliable (its
///  retransmission closes the gap) or unreliable (its loss can stall the
///  strict channel until the next reliable packet is admitted - the reason
///  all protocol-internal traffic travels reliable-ordered).
pub struct OrderingFilter {
    last_accepted: SequenceNumber,
}

impl OrderingFilter {
    pub fn new() -> OrderingFilter {
        OrderingFilter { last_accepted: SequenceNumber::ZERO }
    }

    /// Judges one inbound packet and, when admitting it, advances the
    ///  high-water mark.
    pub fn admit(&mut self, channel: Channel, sequence: SequenceNumber) -> AdmitVerdict {
        let verdict = if channel.is_ordered() {
            if channel.is_reliable() {
                // strict FIFO, no head-of-line buffering
                if sequence == self.last_accepted.next() {
                    AdmitVerdict::Admit
                } else if sequence <= self.last_accepted {
                    AdmitVerdict::DropStale
                } else {
                    AdmitVerdict::DropAhead
                }
            } else {
                // newest wins, skipped numbers are abandoned for good
                if sequence > self.last_accepted {
                    AdmitVerdict::Admit
                } else {
                    AdmitVerdict::DropStale
                }
            }
        } else {
            AdmitVerdict::Admit
        };

        if verdict == AdmitVerdict::Admit {
            self.last_accepted = self.last_accepted.max(sequence);
        } else {
            trace!("{:?} for #{} on {}, high-water mark {}", verdict, sequence, channel.label(), self.last_accepted);
        }
        verdict
    }

    pub fn last_accepted(&self) -> SequenceNumber {
        self.last_accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use AdmitVerdict::*;

    const RO: Channel = Channel::RELIABLE.union(Channel::ORDERED);
    const UO: Channel = Channel::ORDERED;
    const RU: Channel = Channel::RELIABLE;
    const UU: Channel = Channel::empty();

    fn run(filter: &mut OrderingFilter, channel: Channel, raw: u64) -> AdmitVerdict {
        filter.admit(channel, SequenceNumber::from_raw(raw))
    }

    #[rstest]
    #[case::first(1, Admit)]
    #[case::gap_from_start(2, DropAhead)]
    fn test_reliable_ordered_initial(#[case] sequence: u64, #[case] expected: AdmitVerdict) {
        let mut filter = OrderingFilter::new();
        assert_eq!(run(&mut filter, RO, sequence), expected);
    }

    #[test]
    fn test_reliable_ordered_is_strict_fifo() {
        let mut filter = OrderingFilter::new();

        assert_eq!(run(&mut filter, RO, 1), Admit);
        assert_eq!(run(&mut filter, RO, 3), DropAhead); // 2 still missing
        assert_eq!(run(&mut filter, RO, 2), Admit);
        assert_eq!(run(&mut filter, RO, 3), Admit); // retransmission closes the gap in order
        assert_eq!(run(&mut filter, RO, 3), DropStale);
        assert_eq!(run(&mut filter, RO, 1), DropStale);
    }

    #[test]
    fn test_unreliable_ordered_newest_wins() {
        let mut filter = OrderingFilter::new();

        assert_eq!(run(&mut filter, UO, 5), Admit); // skipping 1..4 is fine
        assert_eq!(run(&mut filter, UO, 4), DropStale);
        assert_eq!(run(&mut filter, UO, 5), DropStale);
        assert_eq!(run(&mut filter, UO, 9), Admit);
    }

    #[rstest]
    #[case::reliable(RU)]
    #[case::unreliable(UU)]
    fn test_unordered_always_admits(#[case] channel: Channel) {
        let mut filter = OrderingFilter::new();

        for sequence in [5u64, 3, 5, 100, 1] {
            assert_eq!(run(&mut filter, channel, sequence), Admit);
        }
    }

    #[test]
    fn test_admitted_traffic_advances_shared_mark() {
        let mut filter = OrderingFilter::new();

        // handshake traffic on the reliable-unordered path
        assert_eq!(run(&mut filter, RU, 1), Admit);
        assert_eq!(run(&mut filter, RU, 2), Admit);

        // the strict channel continues seamlessly from the shared mark
        assert_eq!(run(&mut filter, RO, 3), Admit);

        // an interleaved keep-alive advances it further
        assert_eq!(run(&mut filter, UU, 4), Admit);
        assert_eq!(run(&mut filter, RO, 5), Admit);
    }

    #[test]
    fn test_unordered_mark_update_is_monotonic() {
        let mut filter = OrderingFilter::new();

        assert_eq!(run(&mut filter, RU, 7), Admit);
        assert_eq!(run(&mut filter, RU, 3), Admit); // late but admitted - must not regress the mark
        assert_eq!(filter.last_accepted(), SequenceNumber::from_raw(7));
        assert_eq!(run(&mut filter, RO, 8), Admit);
    }
}
