use bitflags::bitflags;

bitflags! {
    /// The delivery discipline for an outgoing packet, chosen per send call.
    ///
    /// The flag bits are the high nibble of the wire header's first byte and
    ///  are combinable: `RELIABLE | ORDERED` is the strict-FIFO channel,
    ///  `Channel::empty()` is plain fire-and-forget UDP semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Channel: u8 {
        const RELIABLE = 0x10;
        const ORDERED  = 0x20;
    }
}

impl Channel {
    pub fn is_reliable(&self) -> bool {
        self.contains(Channel::RELIABLE)
    }

    pub fn is_ordered(&self) -> bool {
        self.contains(Channel::ORDERED)
    }

    /// compact channel tag for log output
    pub fn label(&self) -> &'static str {
        match (self.is_reliable(), self.is_ordered()) {
            (false, false) => "UU",
            (false, true) => "UO",
            (true, false) => "RU",
            (true, true) => "RO",
        }
    }
}
