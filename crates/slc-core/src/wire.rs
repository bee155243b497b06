//! Binary wire layout of status records.
//!
//! All integers and floats are big-endian. The layout is fixed per record
//! variant:
//!
//! ```text
//! offset size field
//! 0      2    kind (1 = hv, 2 = readout)
//! 2      2    revision
//! 4      4    state
//! 8      4    config_id
//! 12     8    updated_at (unix seconds)
//! 20     4    channel_count
//! -- readout only --
//! 24     4    exp_number
//! 28     4    run_number
//! 32     8    event_count
//! -- channel_count times --
//! +0     4    channel state
//! +4     4    vmon (f32)
//! +8     4    imon (f32)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Every read is preceded by a length check against `Buf::remaining`, so
//! malformed input yields a [`WireError`] instead of a panic inside `bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::{Fault, FaultKind};
use crate::record::{
    ChannelState, ChannelStatus, HvStatus, NodeState, PublishableStatus, ReadoutStatus,
    RecordKind, StatusRecord,
};

/// Current layout revision.
pub const WIRE_REVISION: u16 = 1;

const HEADER_LEN: usize = 24;
const READOUT_EXTRA_LEN: usize = 16;
const CHANNEL_LEN: usize = 12;

/// Errors raised while decoding a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated record: need {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("unknown record kind {0}")]
    UnknownKind(u16),

    #[error("unsupported layout revision {0}")]
    UnknownRevision(u16),

    #[error("unknown node state code {0}")]
    UnknownState(u32),

    #[error("unknown channel state code {0}")]
    UnknownChannelState(u32),

    #[error("{kind} record declares {count} channels, maximum is {max}")]
    TooManyChannels {
        kind: RecordKind,
        count: u32,
        max: usize,
    },
}

impl WireError {
    pub fn kind(&self) -> FaultKind {
        FaultKind::Decode
    }
}

impl From<WireError> for Fault {
    fn from(err: WireError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

/// Number of bytes `record` occupies on the wire.
pub fn encoded_len(record: &StatusRecord) -> usize {
    let extra = match record {
        StatusRecord::Hv(_) => 0,
        StatusRecord::Readout(_) => READOUT_EXTRA_LEN,
    };
    HEADER_LEN + extra + record.channels().len() * CHANNEL_LEN
}

/// Encodes a record into its wire layout.
pub fn encode(record: &StatusRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(record));
    buf.put_u16(record.kind().code());
    buf.put_u16(WIRE_REVISION);
    buf.put_u32(record.state().code());
    buf.put_u32(record.config_id());
    buf.put_u64(record.updated_at());
    // Channel count is bounded by the variant maximum, well inside u32.
    buf.put_u32(record.channels().len() as u32);

    if let StatusRecord::Readout(r) = record {
        buf.put_u32(r.exp_number);
        buf.put_u32(r.run_number);
        buf.put_u64(r.event_count);
    }

    for ch in record.channels() {
        put_channel(&mut buf, ch);
    }
    buf.freeze()
}

/// Appends one channel entry to `buf`.
pub fn put_channel(buf: &mut BytesMut, ch: &ChannelStatus) {
    buf.put_u32(ch.state.code());
    buf.put_f32(ch.vmon);
    buf.put_f32(ch.imon);
}

/// Decodes a record from exactly `bytes`.
pub fn decode(bytes: &[u8]) -> Result<StatusRecord, WireError> {
    let mut buf = bytes;

    ensure(&buf, HEADER_LEN)?;
    let kind_code = buf.get_u16();
    let kind = RecordKind::from_code(kind_code).ok_or(WireError::UnknownKind(kind_code))?;
    let revision = buf.get_u16();
    if revision != WIRE_REVISION {
        return Err(WireError::UnknownRevision(revision));
    }
    let state_code = buf.get_u32();
    let state = NodeState::from_code(state_code).ok_or(WireError::UnknownState(state_code))?;
    let config_id = buf.get_u32();
    let updated_at = buf.get_u64();
    let count = buf.get_u32();

    let max = kind.max_channels();
    let count_usize = usize::try_from(count).unwrap_or(usize::MAX);
    if count_usize > max {
        return Err(WireError::TooManyChannels { kind, count, max });
    }

    let record = match kind {
        RecordKind::Hv => {
            let channels = get_channels(&mut buf, count_usize)?;
            StatusRecord::Hv(HvStatus {
                state,
                config_id,
                updated_at,
                channels,
            })
        }
        RecordKind::Readout => {
            ensure(&buf, READOUT_EXTRA_LEN)?;
            let exp_number = buf.get_u32();
            let run_number = buf.get_u32();
            let event_count = buf.get_u64();
            let channels = get_channels(&mut buf, count_usize)?;
            StatusRecord::Readout(ReadoutStatus {
                state,
                config_id,
                updated_at,
                channels,
                exp_number,
                run_number,
                event_count,
            })
        }
    };

    if buf.has_remaining() {
        return Err(WireError::TrailingBytes(buf.remaining()));
    }
    Ok(record)
}

/// Reads `count` channel entries from `buf`.
pub fn get_channels(buf: &mut impl Buf, count: usize) -> Result<Vec<ChannelStatus>, WireError> {
    ensure(&*buf, count.saturating_mul(CHANNEL_LEN))?;
    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        let code = buf.get_u32();
        let state = ChannelState::from_code(code).ok_or(WireError::UnknownChannelState(code))?;
        let vmon = buf.get_f32();
        let imon = buf.get_f32();
        channels.push(ChannelStatus { state, vmon, imon });
    }
    Ok(channels)
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HV_MAX_CHANNELS, READOUT_MAX_CHANNELS};

    fn sample_hv(channels: usize) -> StatusRecord {
        let mut record = StatusRecord::allocate(RecordKind::Hv, channels).unwrap();
        record.set_state(NodeState::Running);
        record.set_config_id(17);
        record.set_updated_at(1_700_000_000);
        for (i, ch) in record.channels_mut().iter_mut().enumerate() {
            ch.state = ChannelState::from_code((i % 6) as u32).unwrap();
            ch.vmon = 1500.25 + i as f32;
            ch.imon = 0.5 * i as f32;
        }
        record
    }

    #[test]
    fn test_hv_round_trip_channel_counts() {
        for count in [0, 1, HV_MAX_CHANNELS] {
            let record = sample_hv(count);
            let bytes = encode(&record);
            assert_eq!(bytes.len(), encoded_len(&record));
            assert_eq!(decode(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn test_readout_round_trip() {
        let mut record = StatusRecord::allocate(RecordKind::Readout, READOUT_MAX_CHANNELS).unwrap();
        record.set_state(NodeState::Ready);
        record.set_config_id(3);
        {
            let r = record.as_readout_mut().unwrap();
            r.exp_number = 12;
            r.run_number = 345;
            r.event_count = u64::MAX - 1;
        }
        let bytes = encode(&record);
        assert_eq!(bytes.len(), 24 + 16 + READOUT_MAX_CHANNELS * 12);
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_header_is_big_endian() {
        let bytes = encode(&sample_hv(1));
        assert_eq!(&bytes[0..2], &[0, 1]);
        assert_eq!(&bytes[2..4], &[0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 17]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let bytes = encode(&sample_hv(3));
        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
        assert!(matches!(decode(&bytes[..10]), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode(&sample_hv(1)).to_vec();
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_rejects_unknown_codes() {
        let mut bytes = encode(&sample_hv(1)).to_vec();
        bytes[1] = 9;
        assert_eq!(decode(&bytes), Err(WireError::UnknownKind(9)));

        let mut bytes = encode(&sample_hv(1)).to_vec();
        bytes[3] = 2;
        assert_eq!(decode(&bytes), Err(WireError::UnknownRevision(2)));

        let mut bytes = encode(&sample_hv(1)).to_vec();
        bytes[7] = 7;
        assert_eq!(decode(&bytes), Err(WireError::UnknownState(7)));

        let mut bytes = encode(&sample_hv(1)).to_vec();
        bytes[27] = 6;
        assert_eq!(decode(&bytes), Err(WireError::UnknownChannelState(6)));
    }

    #[test]
    fn test_decode_rejects_too_many_channels() {
        let mut bytes = encode(&sample_hv(0)).to_vec();
        bytes[20..24].copy_from_slice(&93u32.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(WireError::TooManyChannels { count: 93, .. })
        ));
    }

    #[test]
    fn test_wire_error_maps_to_decode_fault() {
        let fault: Fault = WireError::UnknownKind(4).into();
        assert_eq!(fault.kind, FaultKind::Decode);
    }
}
