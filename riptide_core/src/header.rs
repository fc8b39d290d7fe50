//! Datagram framing header. The first byte of every serialized message.
//!
//! Numeric values are a stable wire contract and must never be renumbered.

/// First-byte tag identifying the shape of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderTag {
    Unreliable = 0,
    UnreliableAutoRelay = 1,
    Ack = 2,
    AckExtra = 3,
    Connect = 4,
    Heartbeat = 5,
    Disconnect = 6,
    Reliable = 7,
    ReliableAutoRelay = 8,
    Welcome = 9,
    ClientConnected = 10,
    ClientDisconnected = 11,
    Notify = 12,
    Reject = 13,
}

impl HeaderTag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for HeaderTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use HeaderTag::*;
        Ok(match value {
            0 => Unreliable,
            1 => UnreliableAutoRelay,
            2 => Ack,
            3 => AckExtra,
            4 => Connect,
            5 => Heartbeat,
            6 => Disconnect,
            7 => Reliable,
            8 => ReliableAutoRelay,
            9 => Welcome,
            10 => ClientConnected,
            11 => ClientDisconnected,
            12 => Notify,
            13 => Reject,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_are_stable() {
        assert_eq!(HeaderTag::Unreliable.as_u8(), 0);
        assert_eq!(HeaderTag::UnreliableAutoRelay.as_u8(), 1);
        assert_eq!(HeaderTag::Ack.as_u8(), 2);
        assert_eq!(HeaderTag::AckExtra.as_u8(), 3);
        assert_eq!(HeaderTag::Connect.as_u8(), 4);
        assert_eq!(HeaderTag::Heartbeat.as_u8(), 5);
        assert_eq!(HeaderTag::Disconnect.as_u8(), 6);
        assert_eq!(HeaderTag::Reliable.as_u8(), 7);
        assert_eq!(HeaderTag::ReliableAutoRelay.as_u8(), 8);
        assert_eq!(HeaderTag::Welcome.as_u8(), 9);
        assert_eq!(HeaderTag::ClientConnected.as_u8(), 10);
        assert_eq!(HeaderTag::ClientDisconnected.as_u8(), 11);
        assert_eq!(HeaderTag::Notify.as_u8(), 12);
        assert_eq!(HeaderTag::Reject.as_u8(), 13);
    }

    #[test]
    fn round_trip() {
        for v in 0u8..=13 {
            assert_eq!(HeaderTag::try_from(v).unwrap().as_u8(), v);
        }
        assert!(HeaderTag::try_from(14).is_err());
    }
}
