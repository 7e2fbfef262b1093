//! Binary framing for the outgoing packet stream.
//!
//! Two frame kinds go to subscribers: mux packets carrying one access unit
//! each, and stream-change announcements carrying the full stream table.
//! All integers are big-endian; strings are length-prefixed UTF-8.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{StreamEntry, StreamInfo, StreamKind, StreamPacket};

pub const OPCODE_MUXPKT: u32 = 1;
pub const OPCODE_STREAM_CHANGE: u32 = 2;

const INFO_NONE: u8 = 0;
const INFO_AUDIO: u8 = 1;
const INFO_VIDEO: u8 = 2;

pub fn kind_label(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::MpegAudio => "MPEG2AUDIO",
        StreamKind::Hevc => "HEVC",
        StreamKind::Subtitle => "DVBSUB",
        StreamKind::Teletext => "TELETEXT",
        StreamKind::Rds => "RDS",
    }
}

/// `[opcode][pid][duration][pts][dts][size][payload]`
pub fn mux_packet(pkt: &StreamPacket) -> Bytes {
    let mut b = BytesMut::with_capacity(32 + pkt.data.len());
    b.put_u32(OPCODE_MUXPKT);
    b.put_u32(pkt.pid as u32);
    b.put_u32(pkt.duration);
    b.put_u64(pkt.pts);
    b.put_u64(pkt.dts);
    b.put_u32(pkt.data.len() as u32);
    b.put_slice(pkt.data);
    b.freeze()
}

fn put_string(b: &mut BytesMut, s: &str) {
    b.put_u32(s.len() as u32);
    b.put_slice(s.as_bytes());
}

/// `[opcode][count]` then per stream `[pid][kind][info tag][info fields]`
pub fn stream_change(entries: &[StreamEntry]) -> Bytes {
    let mut b = BytesMut::with_capacity(16 + entries.len() * 48);
    b.put_u32(OPCODE_STREAM_CHANGE);
    b.put_u32(entries.len() as u32);
    for entry in entries {
        b.put_u32(entry.pid as u32);
        put_string(&mut b, kind_label(entry.kind));
        match entry.info {
            Some(StreamInfo::Audio(a)) => {
                b.put_u8(INFO_AUDIO);
                b.put_u32(a.channels);
                b.put_u32(a.sample_rate);
                b.put_u32(a.bit_rate);
                b.put_u32(a.bits_per_sample);
                b.put_u32(a.block_align);
            }
            Some(StreamInfo::Video(v)) => {
                b.put_u8(INFO_VIDEO);
                b.put_u32(v.fps_scale);
                b.put_u32(v.fps_rate);
                b.put_u32(v.width);
                b.put_u32(v.height);
                b.put_f64(v.aspect);
            }
            None => b.put_u8(INFO_NONE),
        }
    }
    b.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AudioInfo;

    #[test]
    fn mux_packet_layout() {
        let pkt = StreamPacket {
            pid: 0x65,
            data: &[0xDE, 0xAD],
            duration: 2351,
            dts: 90_000,
            pts: 90_010,
            stream_change: false,
        };
        let frame = mux_packet(&pkt);
        assert_eq!(&frame[0..4], &OPCODE_MUXPKT.to_be_bytes());
        assert_eq!(&frame[4..8], &0x65u32.to_be_bytes());
        assert_eq!(&frame[8..12], &2351u32.to_be_bytes());
        assert_eq!(&frame[12..20], &90_010u64.to_be_bytes());
        assert_eq!(&frame[20..28], &90_000u64.to_be_bytes());
        assert_eq!(&frame[28..32], &2u32.to_be_bytes());
        assert_eq!(&frame[32..], &[0xDE, 0xAD]);
    }

    #[test]
    fn stream_change_carries_the_table() {
        let entries = [StreamEntry {
            pid: 0x65,
            kind: StreamKind::MpegAudio,
            info: Some(StreamInfo::Audio(AudioInfo {
                channels: 2,
                sample_rate: 44_100,
                bit_rate: 128_000,
                bits_per_sample: 0,
                block_align: 0,
            })),
        }];
        let frame = stream_change(&entries);
        assert_eq!(&frame[0..4], &OPCODE_STREAM_CHANGE.to_be_bytes());
        assert_eq!(&frame[4..8], &1u32.to_be_bytes());
        assert_eq!(&frame[8..12], &0x65u32.to_be_bytes());
        assert_eq!(&frame[12..16], &10u32.to_be_bytes()); // "MPEG2AUDIO"
        assert_eq!(&frame[16..26], b"MPEG2AUDIO");
        assert_eq!(frame[26], 1); // audio info tag
        assert_eq!(&frame[27..31], &2u32.to_be_bytes());
        assert_eq!(&frame[31..35], &44_100u32.to_be_bytes());
    }
}
