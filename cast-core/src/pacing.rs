use bytes::Bytes;

/// The paced network sender the core hands its bytes to.
///
/// Implementations queue and emit UDP datagrams; nothing in the core blocks
/// on them. The core never stores a transport reference, callers pass one
/// into each method that may transmit.
pub trait PacedPacketSender {
    /// Send freshly packetized RTP packets.
    fn send_packets(&mut self, packets: Vec<Bytes>);

    /// Re-send packets pulled from storage after a NACK.
    fn resend_packets(&mut self, packets: Vec<Bytes>);

    /// Send one compound RTCP datagram.
    fn send_rtcp_packet(&mut self, packet: Bytes);
}
