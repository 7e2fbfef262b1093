//! Elementary-stream parsers.
//!
//! Each PID with a recognized codec gets one parser instance built around a
//! rolling PES payload buffer: the demultiplexer appends payload fragments
//! (arbitrarily small, no batching) and calls `parse` after each append.
//! When a full access unit has accumulated, `parse` hands out a slice into
//! the parser-owned buffer; the consumed prefix is dropped at the start of
//! the next `append`, so the slice stays valid until then.

use crate::constants::NOPTS_VALUE;
use crate::demux::SidePidAllocator;
use crate::types::{ParsedFrames, PesHeader, StreamInfo, StreamKind};

pub mod audio;
pub mod subtitle;
pub mod teletext;
pub mod video;

pub use audio::MpegAudioParser;
pub use subtitle::SubtitleParser;
pub use teletext::TeletextParser;
pub use video::HevcParser;

/// Rolling PES payload buffer shared by all concrete parsers.
///
/// Cursor invariant: `0 <= next_frame_ptr <= len()`, `parser_ptr <= len()`.
/// `time_pos` marks the offset above which the current PTS/DTS epoch is
/// authoritative; bytes below it were appended under the previous PES
/// header and belong to the previous epoch. It goes negative after a cut
/// removed more bytes than the current epoch spans, which keeps the
/// "at or after time_pos" comparison correct.
pub(crate) struct PesBuffer {
    pub(crate) buf: Vec<u8>,
    pub(crate) parser_ptr: usize,
    pub(crate) next_frame_ptr: usize,
    pub(crate) time_pos: i64,
    /// Elementary-stream byte count declared by the current PES header
    /// (0 = unbounded)
    pub(crate) packet_length: usize,
    pub(crate) cur_pts: u64,
    pub(crate) cur_dts: u64,
    pub(crate) prev_pts: u64,
    pub(crate) prev_dts: u64,
    max_size: usize,
}

impl PesBuffer {
    pub(crate) fn new(initial: usize, max_size: usize) -> Self {
        PesBuffer {
            buf: Vec::with_capacity(initial),
            parser_ptr: 0,
            next_frame_ptr: 0,
            time_pos: 0,
            packet_length: 0,
            cur_pts: NOPTS_VALUE,
            cur_dts: NOPTS_VALUE,
            prev_pts: NOPTS_VALUE,
            prev_dts: NOPTS_VALUE,
            max_size,
        }
    }

    /// Append a PES payload fragment. `header` is present only on the
    /// fragment that starts a new PES packet; it rolls the timestamp epoch
    /// over and stamps `time_pos`.
    ///
    /// Returns false when the buffer would have to grow past its hard cap,
    /// which means the stream is corrupt and the owner should drop and
    /// recreate this parser. The buffer is cleared in that case.
    pub(crate) fn append(&mut self, data: &[u8], header: Option<&PesHeader>) -> bool {
        // drop the prefix consumed by the previous parse, keeping the
        // carried-over tail addressable from index 0
        if self.next_frame_ptr > 0 {
            let n = self.next_frame_ptr.min(self.buf.len());
            self.buf.drain(..n);
            self.parser_ptr = self.parser_ptr.saturating_sub(n);
            self.time_pos -= n as i64;
            self.next_frame_ptr = 0;
        }

        if let Some(h) = header {
            self.prev_pts = self.cur_pts;
            self.prev_dts = self.cur_dts;
            self.cur_pts = h.pts;
            self.cur_dts = h.dts;
            self.packet_length = h.payload_length;
            self.time_pos = self.buf.len() as i64;
        }

        if self.buf.len() + data.len() > self.max_size {
            self.clear();
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    /// Mark the whole buffer as consumed; it is dropped on the next append.
    pub(crate) fn consume_all(&mut self) {
        self.next_frame_ptr = self.buf.len();
        self.parser_ptr = 0;
    }

    /// Drop buffered bytes and scan progress. Timestamp epochs survive;
    /// they describe PES packets, not buffer contents.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.parser_ptr = 0;
        self.next_frame_ptr = 0;
        self.time_pos = 0;
        self.packet_length = 0;
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Closed set of elementary-stream parsers, dispatched by match. The
/// variants are fixed at compile time; no trait objects involved.
pub enum ElementaryParser {
    MpegAudio(MpegAudioParser),
    Hevc(HevcParser),
    Subtitle(SubtitleParser),
    Teletext(TeletextParser),
}

impl ElementaryParser {
    /// Feed one PES payload fragment. Returns false when the parser's
    /// buffer cap was exceeded and the parser should be recreated.
    pub fn append(&mut self, data: &[u8], header: Option<&PesHeader>) -> bool {
        match self {
            ElementaryParser::MpegAudio(p) => p.append(data, header),
            ElementaryParser::Hevc(p) => p.append(data, header),
            ElementaryParser::Subtitle(p) => p.append(data, header),
            ElementaryParser::Teletext(p) => p.append(data, header),
        }
    }

    pub fn parse(&mut self, side_pids: &mut SidePidAllocator) -> ParsedFrames<'_> {
        match self {
            ElementaryParser::MpegAudio(p) => p.parse(side_pids),
            ElementaryParser::Hevc(p) => p.parse(),
            ElementaryParser::Subtitle(p) => p.parse(),
            ElementaryParser::Teletext(p) => p.parse(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            ElementaryParser::MpegAudio(p) => p.reset(),
            ElementaryParser::Hevc(p) => p.reset(),
            ElementaryParser::Subtitle(p) => p.reset(),
            ElementaryParser::Teletext(p) => p.reset(),
        }
    }

    pub fn pid(&self) -> u16 {
        match self {
            ElementaryParser::MpegAudio(p) => p.pid(),
            ElementaryParser::Hevc(p) => p.pid(),
            ElementaryParser::Subtitle(p) => p.pid(),
            ElementaryParser::Teletext(p) => p.pid(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            ElementaryParser::MpegAudio(_) => StreamKind::MpegAudio,
            ElementaryParser::Hevc(_) => StreamKind::Hevc,
            ElementaryParser::Subtitle(_) => StreamKind::Subtitle,
            ElementaryParser::Teletext(_) => StreamKind::Teletext,
        }
    }

    /// Last announced format parameters, if the stream has produced any.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        match self {
            ElementaryParser::MpegAudio(p) => p.stream_info().map(StreamInfo::Audio),
            ElementaryParser::Hevc(p) => p.stream_info().map(StreamInfo::Video),
            ElementaryParser::Subtitle(_) | ElementaryParser::Teletext(_) => None,
        }
    }

    /// PID of the ancillary side stream, once one has been allocated.
    pub fn side_pid(&self) -> Option<u16> {
        match self {
            ElementaryParser::MpegAudio(p) => p.rds_pid(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pts: u64, dts: u64, payload_length: usize) -> PesHeader {
        PesHeader {
            pts,
            dts,
            payload_length,
        }
    }

    #[test]
    fn append_carries_over_unconsumed_tail() {
        let mut pes = PesBuffer::new(16, 1024);
        assert!(pes.append(&[1, 2, 3, 4, 5], Some(&header(100, 100, 0))));
        pes.next_frame_ptr = 3; // first three bytes consumed
        assert!(pes.append(&[6, 7], None));
        assert_eq!(&pes.buf[..], &[4, 5, 6, 7]);
        assert_eq!(pes.next_frame_ptr, 0);
    }

    #[test]
    fn header_rolls_timestamp_epoch() {
        let mut pes = PesBuffer::new(16, 1024);
        pes.append(&[0; 4], Some(&header(100, 90, 0)));
        assert_eq!(pes.cur_pts, 100);
        assert_eq!(pes.prev_pts, NOPTS_VALUE);
        assert_eq!(pes.time_pos, 0);

        pes.append(&[0; 4], Some(&header(200, 190, 0)));
        assert_eq!(pes.cur_pts, 200);
        assert_eq!(pes.prev_pts, 100);
        assert_eq!(pes.prev_dts, 90);
        assert_eq!(pes.time_pos, 4);
    }

    #[test]
    fn time_pos_shifts_with_cut_and_may_go_negative() {
        let mut pes = PesBuffer::new(16, 1024);
        pes.append(&[0; 4], Some(&header(100, 100, 0)));
        pes.append(&[0; 4], Some(&header(200, 200, 0)));
        pes.next_frame_ptr = 6; // cut into the second epoch
        pes.append(&[0; 2], None);
        assert_eq!(pes.time_pos, -2);
    }

    #[test]
    fn overflow_clears_and_reports() {
        let mut pes = PesBuffer::new(4, 8);
        assert!(pes.append(&[0; 6], None));
        assert!(!pes.append(&[0; 6], None));
        assert_eq!(pes.len(), 0);
        // recoverable afterwards
        assert!(pes.append(&[0; 6], None));
    }
}
