//! Single-byte acknowledgment values.
//!
//! After every firmware chunk the device answers with exactly one byte.
//! [`ACK`] means "send the next chunk"; every other value, including the
//! device's own reject value [`NAK`], ends the transfer.

/// ASCII ACK: the chunk was accepted.
pub const ACK: u8 = 0x06;

/// ASCII NAK: the value the device uses to reject a chunk.
pub const NAK: u8 = 0x15;

/// What came back from the device for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The device answered with this byte.
    Byte(u8),
    /// The device did not answer within the acknowledgment timeout.
    Timeout,
}

impl Reply {
    /// `true` only for an [`ACK`] byte.
    pub fn is_ack(self) -> bool {
        self == Reply::Byte(ACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_ack_byte_is_ack() {
        assert!(Reply::Byte(ACK).is_ack());
        assert!(!Reply::Byte(NAK).is_ack());
        assert!(!Reply::Byte(0x00).is_ack());
        assert!(!Reply::Timeout.is_ack());
    }
}
