use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Client-to-relay envelope: one payload addressed to one or more logical
///  destination identifiers. The relay fans multicast envelopes out and
///  rewrites them into [`InboundEnvelope`]s carrying the source identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destinations: Vec<String>,
    pub payload: Bytes,
    /// How long relay nodes may hold the frame for an offline destination.
    pub max_holding_secs: u32,
}

/// Relay-to-client envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub source: String,
    pub payload: Bytes,
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("string truncated: declared {} bytes, {} available", len, buf.remaining());
    }
    Ok(String::from_utf8(buf.copy_to_bytes(len).to_vec())?)
}

/// Serializes `body` prefixed with a checksum over it, in one buffer.
fn finalize_with_checksum(body: BytesMut) -> Bytes {
    let mut framed = BytesMut::with_capacity(body.len() + size_of::<u32>());
    framed.put_u32(CRC32.checksum(&body));
    framed.put_slice(&body);
    framed.freeze()
}

fn verify_checksum(buf: &mut impl Buf) -> anyhow::Result<()> {
    let declared = buf.try_get_u32()?;
    let actual = CRC32.checksum(buf.chunk());
    if declared != actual {
        bail!("checksum mismatch: declared {:08x}, actual {:08x}", declared, actual);
    }
    Ok(())
}

impl OutboundEnvelope {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_usize_varint(self.destinations.len());
        for dest in &self.destinations {
            put_string(&mut buf, dest);
        }
        buf.put_usize_varint(self.payload.len());
        buf.put_slice(&self.payload);
        buf.put_u32(self.max_holding_secs);

        finalize_with_checksum(buf)
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OutboundEnvelope> {
        verify_checksum(buf)?;

        let num_destinations = buf.try_get_usize_varint()?;
        let mut destinations = Vec::with_capacity(num_destinations);
        for _ in 0..num_destinations {
            destinations.push(try_get_string(buf)?);
        }

        let payload_len = buf.try_get_usize_varint()?;
        if buf.remaining() < payload_len {
            bail!("payload truncated: declared {} bytes, {} available", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);
        let max_holding_secs = buf.try_get_u32()?;

        Ok(OutboundEnvelope {
            destinations,
            payload,
            max_holding_secs,
        })
    }
}

impl InboundEnvelope {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.source);
        buf.put_usize_varint(self.payload.len());
        buf.put_slice(&self.payload);

        finalize_with_checksum(buf)
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<InboundEnvelope> {
        verify_checksum(buf)?;

        let source = try_get_string(buf)?;
        let payload_len = buf.try_get_usize_varint()?;
        if buf.remaining() < payload_len {
            bail!("payload truncated: declared {} bytes, {} available", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(InboundEnvelope {
            source,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unicast(vec!["alice"], b"payload".as_slice(), 0)]
    #[case::multicast(vec!["alice", "bob", "carol"], b"m".as_slice(), 30)]
    #[case::empty_payload(vec!["alice"], b"".as_slice(), 0)]
    fn test_outbound_ser_deser(#[case] destinations: Vec<&str>, #[case] payload: &[u8], #[case] max_holding_secs: u32) {
        let original = OutboundEnvelope {
            destinations: destinations.into_iter().map(str::to_owned).collect(),
            payload: Bytes::copy_from_slice(payload),
            max_holding_secs,
        };

        let framed = original.ser();
        let mut b: &[u8] = &framed;
        let deser = OutboundEnvelope::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_inbound_ser_deser() {
        let original = InboundEnvelope {
            source: "bob".to_owned(),
            payload: Bytes::from_static(b"hi"),
        };

        let framed = original.ser();
        let mut b: &[u8] = &framed;
        let deser = InboundEnvelope::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_corrupted_frame_is_rejected() {
        let framed = InboundEnvelope {
            source: "bob".to_owned(),
            payload: Bytes::from_static(b"hi"),
        }.ser();

        let mut corrupted = framed.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        let mut b: &[u8] = &corrupted;
        assert!(InboundEnvelope::deser(&mut b).is_err());
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let framed = OutboundEnvelope {
            destinations: vec!["alice".to_owned()],
            payload: Bytes::from_static(b"payload"),
            max_holding_secs: 0,
        }.ser();

        let mut b: &[u8] = &framed[..framed.len() - 3];
        assert!(OutboundEnvelope::deser(&mut b).is_err());
    }
}
