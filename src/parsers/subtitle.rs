//! DVB subtitle elementary-stream parser.
//!
//! The PES payload must open with the substream id bytes `0x20 0x00` and
//! close with the `0xFF` end marker. Once the declared PES packet length is
//! buffered the payload between header and trailer is emitted as one access
//! unit; timestamps pass through from the PES header and duration is 0.

use crate::constants::{SUBTITLE_PES_BUFFER_INITIAL, SUBTITLE_PES_BUFFER_MAX};
use crate::parsers::PesBuffer;
use crate::types::{ParsedFrames, PesHeader, StreamPacket};

pub struct SubtitleParser {
    pid: u16,
    pes: PesBuffer,
}

impl SubtitleParser {
    pub fn new(pid: u16) -> Self {
        SubtitleParser {
            pid,
            pes: PesBuffer::new(SUBTITLE_PES_BUFFER_INITIAL, SUBTITLE_PES_BUFFER_MAX),
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
        let len = self.pes.len();
        if len < 2 {
            return out;
        }
        if self.pes.buf[0] != 0x20 || self.pes.buf[1] != 0x00 {
            self.reset();
            return out;
        }

        let packet_length = self.pes.packet_length;
        if packet_length == 0 || len < packet_length {
            return out;
        }

        let emit = packet_length >= 3 && self.pes.buf[packet_length - 1] == 0xFF;
        self.pes.consume_all();
        if emit {
            out.packet = Some(StreamPacket {
                pid: self.pid,
                data: &self.pes.buf[2..packet_length - 1],
                duration: 0,
                dts: self.pes.cur_dts,
                pts: self.pes.cur_pts,
                stream_change: false,
            });
        }
        out
    }
}
