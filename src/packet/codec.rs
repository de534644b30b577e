//! Batch parsing and serialization of IP packets in channel payloads.
//!
//! Channels carry packets back-to-back with no extra delimiters; the IP
//! length fields are the framing. The codec reads one packet at a time
//! from a contiguous buffer and serializes batches back into one.

use crate::error::{Error, Result};
use crate::packet::IpPacket;

/// Stateless packet codec for channel payloads.
pub struct PacketCodec;

impl PacketCodec {
    /// Read one IP packet beginning at `buf[*idx]` and advance `idx` past it.
    ///
    /// Fails with a malformed-packet error if the header is truncated or
    /// the declared length exceeds the remaining buffer; `idx` is left
    /// unchanged on failure.
    pub fn read_next(buf: &[u8], idx: &mut usize) -> Result<IpPacket> {
        let remaining = buf
            .get(*idx..)
            .ok_or_else(|| Error::malformed("read index past end of buffer"))?;
        let total = IpPacket::peek_total_length(remaining)?;
        if total > remaining.len() {
            return Err(Error::malformed(format!(
                "packet declares {total} bytes but only {} remain",
                remaining.len()
            )));
        }
        let packet = IpPacket::from_bytes(remaining[..total].to_vec())?;
        *idx += total;
        Ok(packet)
    }

    /// Read packets until the buffer is exhausted.
    pub fn read_all(buf: &[u8], idx: &mut usize) -> Result<Vec<IpPacket>> {
        let mut packets = Vec::new();
        while *idx < buf.len() {
            packets.push(Self::read_next(buf, idx)?);
        }
        Ok(packets)
    }

    /// Total wire length of a batch serialized back-to-back.
    pub fn batch_len(packets: &[IpPacket]) -> usize {
        packets.iter().map(|p| p.total_length()).sum()
    }

    /// Append the batch's wire bytes to `out`.
    pub fn serialize_into(packets: &[IpPacket], out: &mut Vec<u8>) {
        out.reserve(Self::batch_len(packets));
        for packet in packets {
            out.extend_from_slice(packet.as_bytes());
        }
    }

    /// Recompute checksums and length fields after external mutation.
    pub fn update(packet: &mut IpPacket) {
        packet.update_checksums();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IpProtocol;
    use std::net::Ipv4Addr;

    fn sample(seq: u8, payload_len: usize) -> IpPacket {
        IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, seq),
            Ipv4Addr::new(10, 0, 1, seq),
            &vec![seq; payload_len],
        )
        .unwrap()
    }

    #[test]
    fn batch_round_trip() {
        let batch = vec![sample(1, 10), sample(2, 0), sample(3, 200)];
        let mut wire = Vec::new();
        PacketCodec::serialize_into(&batch, &mut wire);
        assert_eq!(wire.len(), PacketCodec::batch_len(&batch));

        let mut idx = 0;
        let parsed = PacketCodec::read_all(&wire, &mut idx).unwrap();
        assert_eq!(idx, wire.len());
        assert_eq!(parsed, batch);
    }

    #[test]
    fn truncated_tail_rejected() {
        let packet = sample(1, 32);
        let wire = &packet.as_bytes()[..packet.total_length() - 5];

        let mut idx = 0;
        let err = PacketCodec::read_next(wire, &mut idx).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
        assert_eq!(idx, 0);
    }

    #[test]
    fn read_next_advances_exactly() {
        let a = sample(1, 4);
        let b = sample(2, 8);
        let mut wire = Vec::new();
        PacketCodec::serialize_into(&[a.clone(), b.clone()], &mut wire);

        let mut idx = 0;
        assert_eq!(PacketCodec::read_next(&wire, &mut idx).unwrap(), a);
        assert_eq!(idx, a.total_length());
        assert_eq!(PacketCodec::read_next(&wire, &mut idx).unwrap(), b);
        assert_eq!(idx, wire.len());
    }

    #[test]
    fn clone_is_deep() {
        let original = sample(7, 16);
        let mut copy = original.clone();
        copy.set_payload(&[0xEE; 16]).unwrap();
        assert_ne!(copy, original);
        assert_eq!(original.payload(), &[7u8; 16][..]);
    }
}
