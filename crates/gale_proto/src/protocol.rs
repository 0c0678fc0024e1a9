//! See [`ProtocolId`].

/// Identity of the application-level protocol, carried in every packet
/// header.
///
/// Derived from a stable hash of an application-chosen name, so two
/// applications sharing a port range cannot feed each other's engines:
/// datagrams whose protocol id differs from the local one are dropped before
/// any connection state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolId(pub u32);

impl ProtocolId {
    /// Derives the id for a protocol name.
    ///
    /// The mapping is stable across runs, platforms and versions of this
    /// library; both sides only have to agree on the name.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gale_proto::protocol::ProtocolId;
    /// assert_eq!(ProtocolId::of("my game"), ProtocolId::of("my game"));
    /// assert_ne!(ProtocolId::of("my game"), ProtocolId::of("my game v2"));
    /// ```
    #[must_use]
    pub const fn of(name: &str) -> Self {
        // FNV-1a, 32 bit
        let mut hash = 0x811c_9dc5u32;
        let bytes = name.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u32;
            hash = hash.wrapping_mul(0x0100_0193);
            i += 1;
        }
        Self(hash)
    }
}
