//! Transport-stream demultiplexer.
//!
//! Ingests raw 188-byte TS packets, discovers the program layout from
//! PAT/PMT, creates one elementary-stream parser per recognized PID and
//! drives it with PES payload fragments plus the timestamps recovered from
//! PES headers. Completed access units come back to the caller as borrowed
//! packets, valid until the next packet is pushed.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::constants::{
    NOPTS_VALUE, PES_START_CODE, STREAM_TYPE_HEVC, STREAM_TYPE_MPEG1_AUDIO,
    STREAM_TYPE_MPEG2_AUDIO, STREAM_TYPE_PES_PRIVATE, TS_PACKET_SIZE, TS_SYNC_BYTE,
};
use crate::parsers::{
    ElementaryParser, HevcParser, MpegAudioParser, SubtitleParser, TeletextParser,
};
use crate::psi::{EsEntry, parse_pat, parse_pmt};
use crate::types::{ParsedFrames, PesHeader, StreamEntry, StreamKind};

/// Convert `a` counted in `c`-rate ticks into `b`-rate ticks.
pub fn rescale(a: i64, b: i64, c: i64) -> i64 {
    a * b / c
}

/// Hands out PIDs for ancillary side streams (RDS), unique against every
/// PID already present in the program map.
pub struct SidePidAllocator {
    used: HashSet<u16>,
    next: u16,
}

impl SidePidAllocator {
    pub fn new() -> Self {
        SidePidAllocator {
            used: HashSet::new(),
            next: 0x1E00,
        }
    }

    pub fn mark_used(&mut self, pid: u16) {
        self.used.insert(pid);
    }

    pub fn allocate(&mut self) -> Option<u16> {
        while self.next < 0x1FFF {
            let pid = self.next;
            self.next += 1;
            if self.used.insert(pid) {
                return Some(pid);
            }
        }
        None
    }
}

impl Default for SidePidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn read_pes_timestamp(p: &[u8]) -> u64 {
    ((p[0] as u64 & 0x0E) << 29)
        | ((p[1] as u64) << 22)
        | ((p[2] as u64 & 0xFE) << 14)
        | ((p[3] as u64) << 7)
        | ((p[4] as u64) >> 1)
}

/// Decode a PES packet header at the start of a payload-unit-start
/// fragment. Returns the header and the offset of the first elementary
/// stream byte.
fn parse_pes_header(payload: &[u8]) -> Option<(PesHeader, usize)> {
    if payload.len() < 9 || payload[..3] != PES_START_CODE {
        return None;
    }
    let packet_length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let pts_dts_flags = (payload[7] & 0xC0) >> 6;
    let header_data_length = payload[8] as usize;
    let data_offset = 9 + header_data_length;
    if payload.len() < data_offset {
        return None;
    }

    let mut pts = NOPTS_VALUE;
    let mut dts = NOPTS_VALUE;
    if pts_dts_flags & 0b10 != 0 && payload.len() >= 14 {
        pts = read_pes_timestamp(&payload[9..14]);
        dts = pts;
    }
    if pts_dts_flags == 0b11 && payload.len() >= 19 {
        dts = read_pes_timestamp(&payload[14..19]);
    }

    // PES_packet_length counts from right after the length field; what is
    // left for the elementary stream excludes flags and header data
    let payload_length = if packet_length > 3 + header_data_length {
        packet_length - 3 - header_data_length
    } else {
        0 // 0 also stands for unbounded (video)
    };

    Some((
        PesHeader {
            pts,
            dts,
            payload_length,
        },
        data_offset,
    ))
}

pub struct Demuxer {
    rds_enabled: bool,
    /// PMT pid -> program number, learned from the PAT
    pmt_pids: HashMap<u16, u16>,
    /// PMT pid -> last applied table version
    pmt_versions: HashMap<u16, u8>,
    streams: HashMap<u16, ElementaryParser>,
    side_pids: SidePidAllocator,
    packets_seen: u64,
    packet_errors: u64,
}

impl Demuxer {
    pub fn new(rds_enabled: bool) -> Self {
        Demuxer {
            rds_enabled,
            pmt_pids: HashMap::new(),
            pmt_versions: HashMap::new(),
            streams: HashMap::new(),
            side_pids: SidePidAllocator::new(),
            packets_seen: 0,
            packet_errors: 0,
        }
    }

    /// Well-formed TS packets ingested so far
    pub fn packets_seen(&self) -> u64 {
        self.packets_seen
    }

    /// Packets or sections rejected as malformed
    pub fn packet_errors(&self) -> u64 {
        self.packet_errors
    }

    /// Snapshot of the current stream table, side streams included.
    pub fn stream_table(&self) -> Vec<StreamEntry> {
        let mut entries: Vec<StreamEntry> = self
            .streams
            .values()
            .map(|p| StreamEntry {
                pid: p.pid(),
                kind: p.kind(),
                info: p.stream_info(),
            })
            .collect();
        for p in self.streams.values() {
            if let Some(side) = p.side_pid() {
                entries.push(StreamEntry {
                    pid: side,
                    kind: StreamKind::Rds,
                    info: None,
                });
            }
        }
        entries.sort_by_key(|e| e.pid);
        entries
    }

    /// Feed one 188-byte TS packet and collect whatever access units it
    /// completed. The returned slices borrow parser storage and must be
    /// consumed before the next push.
    pub fn push_packet(&mut self, chunk: &[u8]) -> ParsedFrames<'_> {
        let none = ParsedFrames::default();
        if chunk.len() != TS_PACKET_SIZE || chunk[0] != TS_SYNC_BYTE {
            self.packet_errors += 1;
            return none;
        }
        self.packets_seen += 1;

        let pid = ((chunk[1] & 0x1F) as u16) << 8 | chunk[2] as u16;
        let payload_unit_start = chunk[1] & 0x40 != 0;
        let adaptation_field_ctrl = (chunk[3] & 0x30) >> 4;

        let mut payload_offset = 4usize;
        if adaptation_field_ctrl == 2 || adaptation_field_ctrl == 0 {
            return none; // no payload
        }
        if adaptation_field_ctrl == 3 {
            let adaptation_len = chunk[4] as usize;
            payload_offset += 1 + adaptation_len;
            if payload_offset >= TS_PACKET_SIZE {
                self.packet_errors += 1;
                return none;
            }
        }
        let payload = &chunk[payload_offset..];

        if pid == 0x0000 {
            if payload_unit_start {
                self.handle_pat(payload);
            }
            return none;
        }
        if self.pmt_pids.contains_key(&pid) {
            if payload_unit_start {
                self.handle_pmt(pid, payload);
            }
            return none;
        }
        if !self.streams.contains_key(&pid) {
            return none;
        }

        let mut header = None;
        let mut data = payload;
        if payload_unit_start {
            match parse_pes_header(payload) {
                Some((h, offset)) => {
                    data = &payload[offset..];
                    header = Some(h);
                }
                None => {
                    self.packet_errors += 1;
                    return none;
                }
            }
        }

        let appended = match self.streams.get_mut(&pid) {
            Some(parser) => parser.append(data, header.as_ref()),
            None => return none,
        };
        if !appended {
            warn!("pid {pid}: PES buffer exceeded its cap, recreating parser");
            if let Some(old) = self.streams.remove(&pid) {
                if let Some(mut fresh) = self.build_parser(old.kind(), pid) {
                    // carry the allocated side pid over, otherwise every
                    // recreate would burn a new one and move the RDS stream
                    if let (ElementaryParser::MpegAudio(p), Some(side)) =
                        (&mut fresh, old.side_pid())
                    {
                        p.set_rds_pid(side);
                    }
                    self.streams.insert(pid, fresh);
                }
            }
            return none;
        }

        match self.streams.get_mut(&pid) {
            Some(parser) => parser.parse(&mut self.side_pids),
            None => none,
        }
    }

    fn handle_pat(&mut self, payload: &[u8]) {
        match parse_pat(payload) {
            Ok(pat) if pat.current_next => {
                for entry in &pat.programs {
                    self.side_pids.mark_used(entry.pmt_pid);
                    if self
                        .pmt_pids
                        .insert(entry.pmt_pid, entry.program_number)
                        .is_none()
                    {
                        info!(
                            "program {} announced on PMT pid {}",
                            entry.program_number, entry.pmt_pid
                        );
                    }
                }
            }
            Ok(_) => {} // next-indicator table, not applicable yet
            Err(e) => {
                self.packet_errors += 1;
                debug!("PAT parse failed: {e:#}");
            }
        }
    }

    fn handle_pmt(&mut self, pid: u16, payload: &[u8]) {
        let pmt = match parse_pmt(payload) {
            Ok(pmt) => pmt,
            Err(e) => {
                self.packet_errors += 1;
                debug!("PMT parse failed on pid {pid}: {e:#}");
                return;
            }
        };
        if self.pmt_versions.get(&pid) == Some(&pmt.version) {
            return;
        }
        self.pmt_versions.insert(pid, pmt.version);

        for es in &pmt.streams {
            self.side_pids.mark_used(es.pid);
            if self.streams.contains_key(&es.pid) {
                continue;
            }
            if let Some(parser) = self.parser_for(es) {
                info!(
                    "program {}: {:?} stream on pid {}",
                    pmt.program_number,
                    parser.kind(),
                    es.pid
                );
                self.streams.insert(es.pid, parser);
            } else {
                debug!(
                    "program {}: ignoring stream type {:#04x} on pid {}",
                    pmt.program_number, es.stream_type, es.pid
                );
            }
        }
    }

    fn parser_for(&self, es: &EsEntry) -> Option<ElementaryParser> {
        match es.stream_type {
            STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => Some(ElementaryParser::MpegAudio(
                MpegAudioParser::new(es.pid, self.rds_enabled),
            )),
            STREAM_TYPE_HEVC => Some(ElementaryParser::Hevc(HevcParser::new(es.pid))),
            STREAM_TYPE_PES_PRIVATE if es.has_teletext_descriptor => {
                Some(ElementaryParser::Teletext(TeletextParser::new(es.pid)))
            }
            STREAM_TYPE_PES_PRIVATE if es.has_subtitling_descriptor => {
                Some(ElementaryParser::Subtitle(SubtitleParser::new(es.pid)))
            }
            _ => None,
        }
    }

    fn build_parser(&self, kind: StreamKind, pid: u16) -> Option<ElementaryParser> {
        match kind {
            StreamKind::MpegAudio => Some(ElementaryParser::MpegAudio(MpegAudioParser::new(
                pid,
                self.rds_enabled,
            ))),
            StreamKind::Hevc => Some(ElementaryParser::Hevc(HevcParser::new(pid))),
            StreamKind::Subtitle => Some(ElementaryParser::Subtitle(SubtitleParser::new(pid))),
            StreamKind::Teletext => Some(ElementaryParser::Teletext(TeletextParser::new(pid))),
            StreamKind::Rds => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crc::{CRC_32_MPEG_2, Crc};

    const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

    fn section(table_id: u8, id_extension: u16, body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let mut sec = vec![
            table_id,
            0xB0 | ((section_length >> 8) & 0x0F) as u8,
            (section_length & 0xFF) as u8,
        ];
        sec.extend_from_slice(&id_extension.to_be_bytes());
        sec.push(0xC1);
        sec.push(0x00);
        sec.push(0x00);
        sec.extend_from_slice(body);
        let crc = CRC_MPEG.checksum(&sec);
        sec.extend_from_slice(&crc.to_be_bytes());

        let mut payload = vec![0x00];
        payload.extend_from_slice(&sec);
        payload
    }

    fn ts_packet(pid: u16, pusi: bool, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 184);
        let mut pkt = vec![TS_SYNC_BYTE];
        pkt.push(((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0x00 });
        pkt.push((pid & 0xFF) as u8);
        pkt.push(0x10); // payload only
        pkt.extend_from_slice(payload);
        pkt.resize(TS_PACKET_SIZE, 0xFF);
        pkt
    }

    fn encode_pts(pts: u64) -> [u8; 5] {
        [
            0x21 | ((pts >> 29) as u8 & 0x0E),
            (pts >> 22) as u8,
            0x01 | ((pts >> 14) as u8 & 0xFE),
            (pts >> 7) as u8,
            0x01 | ((pts << 1) as u8 & 0xFE),
        ]
    }

    /// PES packet around `es` with a PTS-only header
    fn pes_packet(pts: u64, es: &[u8]) -> Vec<u8> {
        let packet_length = 3 + 5 + es.len();
        let mut pes = vec![0x00, 0x00, 0x01, 0xC0];
        pes.extend_from_slice(&(packet_length as u16).to_be_bytes());
        pes.push(0x80);
        pes.push(0x80); // PTS only
        pes.push(5);
        pes.extend_from_slice(&encode_pts(pts));
        pes.extend_from_slice(es);
        pes
    }

    fn audio_frame() -> Vec<u8> {
        let mut f = vec![0x33u8; 417];
        f[0] = 0xFF;
        f[1] = 0xFD;
        f[2] = 0x80;
        f[3] = 0x00;
        f
    }

    fn pat_packet() -> Vec<u8> {
        let body = [0x00, 0x01, 0xE1, 0x00]; // program 1 -> PMT pid 0x100
        ts_packet(0, true, &section(0x00, 1, &body))
    }

    fn pmt_packet() -> Vec<u8> {
        let mut body = vec![0xE0, 0x65]; // pcr pid = audio pid
        body.extend_from_slice(&[0xF0, 0x00]);
        body.extend_from_slice(&[0x04, 0xE0, 0x65, 0xF0, 0x00]); // MPEG audio on 0x65
        ts_packet(0x100, true, &section(0x02, 1, &body))
    }

    #[test]
    fn pat_and_pmt_build_the_stream_table() {
        let mut demux = Demuxer::new(true);
        demux.push_packet(&pat_packet());
        demux.push_packet(&pmt_packet());
        let table = demux.stream_table();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].pid, 0x65);
        assert_eq!(table[0].kind, StreamKind::MpegAudio);
    }

    #[test]
    fn audio_frame_travels_through_ts_and_pes_framing() {
        let mut demux = Demuxer::new(true);
        demux.push_packet(&pat_packet());
        demux.push_packet(&pmt_packet());

        let pes = pes_packet(90_000, &audio_frame());
        let mut emitted = Vec::new();
        for (i, chunk) in pes.chunks(184).enumerate() {
            let pkt = ts_packet(0x65, i == 0, chunk);
            let frames = demux.push_packet(&pkt);
            if let Some(p) = frames.packet {
                emitted.push((p.pid, p.pts, p.duration, p.data.len(), p.stream_change));
            }
        }
        assert_eq!(emitted, vec![(0x65, 90_000, 2351, 417, true)]);
    }

    #[test]
    fn malformed_packets_only_bump_the_error_counter() {
        let mut demux = Demuxer::new(true);
        demux.push_packet(&[0u8; 188]); // bad sync byte
        demux.push_packet(&[0x47, 0x00]); // wrong size
        assert_eq!(demux.packet_errors(), 2);
        assert_eq!(demux.packets_seen(), 0);

        // a well-formed packet counts as seen without touching errors
        demux.push_packet(&pat_packet());
        assert_eq!(demux.packets_seen(), 1);
        assert_eq!(demux.packet_errors(), 2);
    }

    #[test]
    fn recreated_parser_keeps_its_rds_side_pid() {
        let mut demux = Demuxer::new(true);
        demux.push_packet(&pat_packet());
        demux.push_packet(&pmt_packet());

        let mut frame = audio_frame();
        let n = frame.len();
        frame[n - 5] = b'C';
        frame[n - 4] = b'B';
        frame[n - 3] = b'A';
        frame[n - 2] = 3;
        frame[n - 1] = 0xFD;

        let deliver = |demux: &mut Demuxer, pts: u64| -> Option<u16> {
            let pes = pes_packet(pts, &frame);
            let mut side = None;
            for (i, chunk) in pes.chunks(184).enumerate() {
                let pkt = ts_packet(0x65, i == 0, chunk);
                if let Some(s) = demux.push_packet(&pkt).side {
                    side = Some(s.pid);
                }
            }
            side
        };

        let side_pid = deliver(&mut demux, 90_000).expect("side pid allocated");

        // flood the audio pid with bytes that never sync until the PES
        // buffer cap trips and the parser is recreated
        for _ in 0..400 {
            demux.push_packet(&ts_packet(0x65, false, &[0u8; 184]));
        }

        let rds: Vec<u16> = demux
            .stream_table()
            .iter()
            .filter(|e| e.kind == StreamKind::Rds)
            .map(|e| e.pid)
            .collect();
        assert_eq!(rds, vec![side_pid]);
        assert_eq!(deliver(&mut demux, 95_000), Some(side_pid));
    }

    #[test]
    fn side_pid_allocator_skips_used_pids() {
        let mut alloc = SidePidAllocator::new();
        alloc.mark_used(0x1E00);
        alloc.mark_used(0x1E01);
        assert_eq!(alloc.allocate(), Some(0x1E02));
        assert_eq!(alloc.allocate(), Some(0x1E03));
    }

    #[test]
    fn pes_header_timestamp_roundtrip() {
        let es = [0xAA; 8];
        let pes = pes_packet(123_456_789, &es);
        let (hdr, offset) = parse_pes_header(&pes).expect("header");
        assert_eq!(hdr.pts, 123_456_789);
        assert_eq!(hdr.dts, 123_456_789);
        assert_eq!(hdr.payload_length, es.len());
        assert_eq!(&pes[offset..], &es);
    }
}
