//! MPEG-1/2 audio (Layer I/II/III) elementary-stream parser.
//!
//! Scans for the 12-bit frame sync, validates the 4-byte header, computes
//! the frame size from the bitrate/sample-rate tables and emits one access
//! unit per complete frame. Frames may carry an RDS ancillary block at the
//! tail (length byte + 0xFD marker, data stored in reverse byte order);
//! when enabled that block is emitted as a second access unit on a lazily
//! allocated side PID.

use log::{debug, warn};

use crate::bitreader::BitReader;
use crate::constants::{
    AUDIO_PES_BUFFER_INITIAL, AUDIO_PES_BUFFER_MAX, MAX_RDS_BUFFER_SIZE,
    MPEG_AUDIO_SAMPLES_PER_FRAME, PTS_CLOCK_HZ, RDS_BUFFER_INITIAL,
};
use crate::demux::SidePidAllocator;
use crate::parsers::PesBuffer;
use crate::types::{AudioInfo, ParsedFrames, PesHeader, StreamPacket};

/// Bitrate in kbit/s by `[mpeg2][layer - 1][bitrate_index]`
const BITRATE_TABLE: [[[u32; 15]; 3]; 2] = [
    [
        [
            0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
        ],
        [
            0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
        ],
        [
            0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
        ],
    ],
    [
        [
            0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
        ],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    ],
];

/// Base sampling frequency by sample-rate index; right-shifted once for
/// MPEG-2 and once more for MPEG-2.5
const FREQUENCY_TABLE: [u32; 3] = [44_100, 48_000, 32_000];

pub struct MpegAudioParser {
    pid: u16,
    pes: PesBuffer,
    found_frame: bool,
    frame_size: usize,
    sample_rate: u32,
    bit_rate: u32,
    channels: u32,
    pts: u64,
    dts: u64,
    info: Option<AudioInfo>,
    rds_enabled: bool,
    rds_pid: u16,
    rds_buf: Vec<u8>,
    /// Tracked RDS buffer size, grown in tenth-of-initial increments
    rds_buf_size: usize,
    /// Cumulative RDS bytes extracted; crossing the hard cap disables RDS
    rds_total: usize,
}

impl MpegAudioParser {
    pub fn new(pid: u16, rds_enabled: bool) -> Self {
        MpegAudioParser {
            pid,
            pes: PesBuffer::new(AUDIO_PES_BUFFER_INITIAL, AUDIO_PES_BUFFER_MAX),
            found_frame: false,
            frame_size: 0,
            sample_rate: 0,
            bit_rate: 0,
            channels: 0,
            pts: 0,
            dts: 0,
            info: None,
            rds_enabled,
            rds_pid: 0,
            rds_buf: Vec::new(),
            rds_buf_size: RDS_BUFFER_INITIAL,
            rds_total: 0,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn rds_pid(&self) -> Option<u16> {
        if self.rds_pid != 0 {
            Some(self.rds_pid)
        } else {
            None
        }
    }

    /// Seed the RDS side pid instead of allocating a fresh one. Used when a
    /// parser is recreated so the announced side pid stays stable.
    pub(crate) fn set_rds_pid(&mut self, pid: u16) {
        self.rds_pid = pid;
    }

    pub fn stream_info(&self) -> Option<AudioInfo> {
        self.info
    }

    pub fn append(&mut self, data: &[u8], header: Option<&PesHeader>) -> bool {
        self.pes.append(data, header)
    }

    pub fn reset(&mut self) {
        self.pes.clear();
        self.found_frame = false;
    }

    pub fn parse(&mut self, side_pids: &mut SidePidAllocator) -> ParsedFrames<'_> {
        let mut p = self.pes.parser_ptr;
        while self.pes.len() - p > 3 {
            if !self.scan_header(p) {
                break;
            }
            p += 1;
        }
        self.pes.parser_ptr = p;

        let mut out = ParsedFrames::default();
        let avail = self.pes.len() - p;
        if self.found_frame && avail >= self.frame_size {
            let stream_change = self.set_audio_information();
            let rds_len = self.extract_rds(p, side_pids);
            let duration =
                (PTS_CLOCK_HZ * MPEG_AUDIO_SAMPLES_PER_FRAME / self.sample_rate as u64) as u32;

            self.pes.next_frame_ptr = p + self.frame_size;
            self.pes.parser_ptr = 0;
            self.found_frame = false;

            out.packet = Some(StreamPacket {
                pid: self.pid,
                data: &self.pes.buf[p..p + self.frame_size],
                duration,
                dts: self.dts,
                pts: self.pts,
                stream_change,
            });
            if let Some(n) = rds_len {
                out.side = Some(StreamPacket {
                    pid: self.rds_pid,
                    data: &self.rds_buf[..n],
                    duration: 0,
                    dts: self.pes.cur_dts,
                    pts: self.pes.cur_pts,
                    stream_change: false,
                });
            }
        }
        out
    }

    /// Try to decode a frame header at buffer offset `p`. Returns true to
    /// keep scanning at the next byte, false to stop (header accepted, or a
    /// frame is already pending emission).
    fn scan_header(&mut self, p: usize) -> bool {
        if self.found_frame {
            return false;
        }

        let buf = &self.pes.buf[p..];
        if buf[0] != 0xFF || buf[1] & 0xE0 != 0xE0 {
            return true;
        }

        let mut bs = BitReader::new(&buf[1..4], 24);
        bs.skip_bits(3); // rest of the sync run

        let audio_version = bs.read_bits(2);
        if audio_version == 0b01 {
            return true; // reserved
        }
        let mpeg2 = (audio_version & 1 == 0) as usize;
        let mpeg25 = (audio_version & 3 == 0) as usize;

        let layer_bits = bs.read_bits(2);
        if layer_bits == 0 {
            return true; // reserved
        }
        let layer = (4 - layer_bits) as usize;

        bs.skip_bits(1); // protection

        let bitrate_index = bs.read_bits(4) as usize;
        if bitrate_index == 15 || bitrate_index == 0 {
            return true;
        }
        let bit_rate = BITRATE_TABLE[mpeg2][layer - 1][bitrate_index] * 1000;

        let sample_rate_index = bs.read_bits(2) as usize;
        if sample_rate_index == 3 {
            return true;
        }
        let sample_rate = FREQUENCY_TABLE[sample_rate_index] >> (mpeg2 + mpeg25);

        let padding = bs.read_bits1();
        bs.skip_bits(1); // private bit
        let channel_mode = bs.read_bits(2);

        self.bit_rate = bit_rate;
        self.sample_rate = sample_rate;
        // channel_mode is a 2-bit field, so this never matches and the
        // reported channel count stays 2
        self.channels = if channel_mode == 11 { 1 } else { 2 };

        self.frame_size = if layer == 1 {
            ((12 * bit_rate / sample_rate + padding) * 4) as usize
        } else {
            (144 * bit_rate / sample_rate + padding) as usize
        };

        self.found_frame = true;
        self.dts = self.pes.cur_pts;
        self.pts = self.pes.cur_pts;
        if self.pes.cur_pts != crate::constants::NOPTS_VALUE {
            self.pes.cur_pts += PTS_CLOCK_HZ * MPEG_AUDIO_SAMPLES_PER_FRAME / sample_rate as u64;
        }
        false
    }

    fn set_audio_information(&mut self) -> bool {
        let next = AudioInfo {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bit_rate: self.bit_rate,
            bits_per_sample: 0,
            block_align: 0,
        };
        if self.info == Some(next) {
            false
        } else {
            self.info = Some(next);
            true
        }
    }

    /// Pull the reversed RDS block off the tail of the frame at offset `p`,
    /// if present. Returns the number of bytes staged in `rds_buf`.
    fn extract_rds(&mut self, p: usize, side_pids: &mut SidePidAllocator) -> Option<usize> {
        if !self.rds_enabled || self.frame_size < 3 {
            return None;
        }
        let end = p + self.frame_size;
        let rdsl = self.pes.buf[end - 2] as usize;
        if self.pes.buf[end - 1] != 0xFD || rdsl == 0 {
            return None;
        }
        if rdsl + 2 > self.frame_size {
            return None; // length byte points outside this frame
        }

        self.rds_total += rdsl;
        if self.rds_total > MAX_RDS_BUFFER_SIZE {
            warn!(
                "pid {}: RDS volume exceeded {} bytes, disabling RDS extraction",
                self.pid, MAX_RDS_BUFFER_SIZE
            );
            self.rds_enabled = false;
            return None;
        }
        while rdsl >= self.rds_buf_size {
            self.rds_buf_size += RDS_BUFFER_INITIAL / 10;
        }

        if self.rds_pid == 0 {
            match side_pids.allocate() {
                Some(pid) => {
                    debug!("pid {}: RDS data found, side pid {}", self.pid, pid);
                    self.rds_pid = pid;
                }
                None => {
                    warn!("pid {}: no side pid available for RDS", self.pid);
                    self.rds_enabled = false;
                    return None;
                }
            }
        }

        self.rds_buf.clear();
        self.rds_buf.reserve(self.rds_buf_size.min(MAX_RDS_BUFFER_SIZE));
        for i in ((end - 2 - rdsl)..(end - 2)).rev() {
            self.rds_buf.push(self.pes.buf[i]);
        }
        Some(rdsl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pts: u64) -> PesHeader {
        PesHeader {
            pts,
            dts: pts,
            payload_length: 0,
        }
    }

    /// MPEG-1 Layer II, 128 kbit/s, 44.1 kHz, no padding, stereo.
    /// Frame size 144*128000/44100 = 417.
    fn layer2_frame(fill: u8) -> Vec<u8> {
        let mut f = vec![fill; 417];
        f[0] = 0xFF;
        f[1] = 0xFD; // sync + MPEG-1 + layer II + no protection
        f[2] = 0x80; // bitrate index 8 (128k), 44.1 kHz, no padding
        f[3] = 0x00;
        f
    }

    fn parser() -> (MpegAudioParser, SidePidAllocator) {
        (MpegAudioParser::new(0x65, true), SidePidAllocator::new())
    }

    #[test]
    fn layer2_frame_size_and_duration() {
        let (mut p, mut pids) = parser();
        p.append(&layer2_frame(0xAA), Some(&header(90_000)));
        let frames = p.parse(&mut pids);
        let pkt = frames.packet.expect("frame");
        assert_eq!(pkt.data.len(), 417);
        assert_eq!(pkt.duration, 2351); // 90000*1152/44100, truncating
        assert_eq!(pkt.pts, 90_000);
        assert_eq!(pkt.dts, 90_000);
        assert!(pkt.stream_change);
    }

    #[test]
    fn layer1_frame_size_formula() {
        // MPEG-1 Layer I, 128 kbit/s (index 4), 44.1 kHz, padding set:
        // (12*128000/44100 + 1) * 4 = 140 with truncating division
        let mut f = vec![0u8; 140];
        f[0] = 0xFF;
        f[1] = 0xFF; // MPEG-1, layer I
        f[2] = 0x42; // bitrate index 4, 44.1 kHz, padding
        f[3] = 0x00;

        let (mut p, mut pids) = parser();
        p.append(&f, Some(&header(0)));
        let frames = p.parse(&mut pids);
        assert_eq!(frames.packet.expect("frame").data.len(), 140);
    }

    #[test]
    fn invalid_headers_never_sync() {
        let cases: [[u8; 4]; 5] = [
            [0xFF, 0xE8, 0x80, 0x00], // version 01 (reserved)
            [0xFF, 0xF9, 0x80, 0x00], // layer 00 (reserved)
            [0xFF, 0xFD, 0x00, 0x00], // bitrate index 0
            [0xFF, 0xFD, 0xF0, 0x00], // bitrate index 15
            [0xFF, 0xFD, 0x8C, 0x00], // sample-rate index 3
        ];
        for bad in cases {
            let mut f = vec![0u8; 600];
            f[..4].copy_from_slice(&bad);
            let (mut p, mut pids) = parser();
            p.append(&f, Some(&header(0)));
            let frames = p.parse(&mut pids);
            assert!(frames.packet.is_none(), "header {bad:02X?} must not sync");
        }
    }

    #[test]
    fn ten_frames_one_byte_at_a_time() {
        let (mut p, mut pids) = parser();
        let frame = layer2_frame(0x11);

        let mut emitted = Vec::new();
        let mut first = true;
        for _ in 0..10 {
            for &b in &frame {
                let hdr = if first { Some(header(90_000)) } else { None };
                first = false;
                assert!(p.append(&[b], hdr.as_ref()));
                let frames = p.parse(&mut pids);
                if let Some(pkt) = frames.packet {
                    emitted.push((pkt.pts, pkt.duration, pkt.data.len()));
                }
            }
        }
        // the final frame completes only once its last byte arrives
        assert_eq!(emitted.len(), 10);
        for (k, (pts, duration, len)) in emitted.iter().enumerate() {
            assert_eq!(*duration, 2351);
            assert_eq!(*len, 417);
            assert_eq!(*pts, 90_000 + k as u64 * 2351);
        }
    }

    #[test]
    fn stream_change_flag_latches_once() {
        let (mut p, mut pids) = parser();
        p.append(&layer2_frame(1), Some(&header(0)));
        assert!(p.parse(&mut pids).packet.expect("frame").stream_change);
        p.append(&layer2_frame(2), None);
        assert!(!p.parse(&mut pids).packet.expect("frame").stream_change);
    }

    #[test]
    fn channel_mode_quirk_never_reports_mono() {
        let (mut p, mut pids) = parser();
        let mut f = layer2_frame(0);
        f[3] = 0xC0; // channel mode bits 11 (single channel)
        p.append(&f, Some(&header(0)));
        assert!(p.parse(&mut pids).packet.is_some());
        assert_eq!(p.stream_info().expect("info").channels, 2);
    }

    #[test]
    fn rds_block_is_reversed_and_on_side_pid() {
        let (mut p, mut pids) = parser();
        let mut f = layer2_frame(0);
        let n = f.len();
        // "ABC" stored reversed, then length byte and 0xFD marker
        f[n - 5] = b'C';
        f[n - 4] = b'B';
        f[n - 3] = b'A';
        f[n - 2] = 3;
        f[n - 1] = 0xFD;

        p.append(&f, Some(&header(1000)));
        let frames = p.parse(&mut pids);
        assert!(frames.packet.is_some());
        let side = frames.side.expect("rds packet");
        assert_eq!(side.data, b"ABC");
        assert_eq!(side.duration, 0);
        assert_eq!(Some(side.pid), p.rds_pid());
    }

    #[test]
    fn frames_without_marker_produce_no_side_packet() {
        let (mut p, mut pids) = parser();
        p.append(&layer2_frame(0x55), Some(&header(0)));
        let frames = p.parse(&mut pids);
        assert!(frames.packet.is_some());
        assert!(frames.side.is_none());
        assert_eq!(p.rds_pid(), None);
    }

    #[test]
    fn rds_cap_disables_extraction_but_not_audio() {
        let (mut p, mut pids) = parser();
        let mut f = layer2_frame(0x55);
        let n = f.len();
        f[n - 2] = 250;
        f[n - 1] = 0xFD;

        let mut side_count = 0;
        let mut audio_count = 0;
        let mut first = true;
        for _ in 0..450 {
            let hdr = if first { Some(header(0)) } else { None };
            first = false;
            p.append(&f, hdr.as_ref());
            let frames = p.parse(&mut pids);
            if frames.packet.is_some() {
                audio_count += 1;
            }
            if frames.side.is_some() {
                side_count += 1;
            }
        }
        assert_eq!(audio_count, 450);
        // 400 * 250 = 100_000; the frame crossing the cap and everything
        // after it carries no side data
        assert_eq!(side_count, 400);
    }
}
