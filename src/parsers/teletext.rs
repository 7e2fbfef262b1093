//! EBU teletext elementary-stream parser.
//!
//! The first payload byte must be a teletext data-unit id (0x10..=0x1F).
//! Unlike subtitles the whole PES payload is forwarded unmodified once the
//! declared packet length is buffered.

use crate::constants::{TELETEXT_PES_BUFFER_INITIAL, TELETEXT_PES_BUFFER_MAX};
use crate::parsers::PesBuffer;
use crate::types::{ParsedFrames, PesHeader, StreamPacket};

pub struct TeletextParser {
    pid: u16,
    pes: PesBuffer,
}

impl TeletextParser {
    pub fn new(pid: u16) -> Self {
        TeletextParser {
            pid,
            pes: PesBuffer::new(TELETEXT_PES_BUFFER_INITIAL, TELETEXT_PES_BUFFER_MAX),
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn append(&mut self, data: &[u8], header: Option<&PesHeader>) -> bool {
        self.pes.append(data, header)
    }

    pub fn reset(&mut self) {
        self.pes.clear();
    }

    pub fn parse(&mut self) -> ParsedFrames<'_> {
        let mut out = ParsedFrames::default();
        if self.pes.buf.is_empty() {
            return out;
        }
        if !(0x10..=0x1F).contains(&self.pes.buf[0]) {
            self.reset();
            return out;
        }

        let packet_length = self.pes.packet_length;
        if packet_length == 0 || self.pes.len() < packet_length {
            return out;
        }

        self.pes.consume_all();
        out.packet = Some(StreamPacket {
            pid: self.pid,
            data: &self.pes.buf[..packet_length],
            duration: 0,
            dts: self.pes.cur_dts,
            pts: self.pes.cur_pts,
            stream_change: false,
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pts: u64, payload_length: usize) -> PesHeader {
        PesHeader {
            pts,
            dts: pts,
            payload_length,
        }
    }

    #[test]
    fn forwards_whole_payload() {
        let payload = [0x10, 0xAA, 0xBB, 0xCC];
        let mut p = TeletextParser::new(0x300);
        p.append(&payload, Some(&header(7000, payload.len())));
        let pkt = p.parse().packet.expect("teletext unit");
        assert_eq!(pkt.data, &payload);
        assert_eq!(pkt.duration, 0);
        assert_eq!(pkt.pts, 7000);
    }

    #[test]
    fn accepts_whole_data_unit_id_range() {
        for id in 0x10..=0x1Fu8 {
            let payload = [id, 1, 2];
            let mut p = TeletextParser::new(0x300);
            p.append(&payload, Some(&header(0, payload.len())));
            assert!(p.parse().packet.is_some(), "id {id:#x}");
        }
    }

    #[test]
    fn invalid_data_unit_id_resets() {
        let mut p = TeletextParser::new(0x300);
        p.append(&[0x0F, 1, 2], Some(&header(0, 3)));
        assert!(p.parse().packet.is_none());
        assert_eq!(p.pes.len(), 0);
    }

    #[test]
    fn waits_for_declared_length() {
        let payload = [0x1A, 5, 6, 7];
        let mut p = TeletextParser::new(0x300);
        p.append(&payload[..2], Some(&header(0, payload.len())));
        assert!(p.parse().packet.is_none());
        p.append(&payload[2..], None);
        assert_eq!(p.parse().packet.expect("unit").data, &payload);
    }
}
