// Copyright (c) 2024, The rQUIC Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Receiver side: packet classification, coded-packet bookkeeping,
//! loss recovery and ordered release toward the QUIC decrypt path.

mod parsed;
mod recovery;
mod rx_buffer;

use crate::buffer::{BufferPool, PacketBuffer};
use crate::error::FecError;
use crate::schemes::CoeffUnpacker;
use crate::tuning::RuntimeTuning;
use crate::wire::{
    self, id_older, id_older_eq, pld_len_read, pld_len_write, Scheme, WireType, FLAG_CODED,
    FLAG_SOURCE, GEN_MARGIN, LEN_OF_SRC_LEN, MIN_RATIO, RX_REDUN_MARGIN, SRC_HEADER_SIZE,
};
use log::{debug, error, info, warn};
use parsed::{ParsedCod, ParsedSrc};
use rx_buffer::{RxBuffer, RxEntry};
use std::time::{Duration, Instant};

/// What a processed datagram turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Unprotected,
    Protected,
    Coded,
    Unknown,
    Obsolete,
}

pub struct Decoder {
    pkts_src: Vec<ParsedSrc>,
    pub(crate) pkts_cod: Vec<ParsedCod>,

    dcid_len: usize,
    last_scheme: u8,
    unpacker: CoeffUnpacker,

    scope_init: bool,
    last_seen_gen: u8,
    last_seen_pkt: u8,
    last_seen_overlap: u8,
    obsolete_xhold: u8,

    /// Received SRC ids, duplicate-free and modular-sorted.
    src_avbl: Vec<u8>,
    /// Ids expected but not yet received, rebuilt before each recovery.
    pub(crate) src_miss: Vec<u8>,
    /// First covered SRC id per generation, learned from coded packets.
    gen_starts: Vec<(u8, u8)>,

    pollution: f64,
    pollution_seen: bool,

    pool: BufferPool,
    tuning: RuntimeTuning,
    buffer: RxBuffer,
}

impl Decoder {
    pub fn new(tuning: RuntimeTuning, pool: BufferPool, max_ack_delay: Duration) -> Decoder {
        Decoder {
            pkts_src: Vec::new(),
            pkts_cod: Vec::new(),
            dcid_len: 0,
            last_scheme: Scheme::Xor.code(),
            unpacker: CoeffUnpacker::new(Scheme::Xor),
            scope_init: false,
            last_seen_gen: 0,
            last_seen_pkt: 0,
            last_seen_overlap: 1,
            obsolete_xhold: 0,
            src_avbl: Vec::new(),
            src_miss: Vec::new(),
            gen_starts: Vec::new(),
            pollution: MIN_RATIO * RX_REDUN_MARGIN,
            pollution_seen: false,
            pool,
            buffer: RxBuffer::new(&tuning, max_ack_delay),
            tuning,
        }
    }

    /// Classifies and absorbs one received datagram. Returns the packet
    /// kind and whether any SRC was recovered along the way. Source packets
    /// (native, recovered and unprotected) surface later through
    /// [`Decoder::pop_ready`].
    pub fn process(
        &mut self,
        buf: PacketBuffer,
        dcid_len: usize,
        now: Instant,
    ) -> (PacketKind, bool) {
        self.dcid_len = dcid_len;
        let r_hdr_pos = 1 + dcid_len;
        if buf.len() < r_hdr_pos + 1 {
            warn!("{}", FecError::Malformed("datagram shorter than its header"));
            return (PacketKind::Unknown, false);
        }
        match WireType::from_byte(buf.as_slice()[r_hdr_pos + wire::FIELD_POS_TYPE]) {
            WireType::Unprotected => {
                let mut buf = buf;
                buf.strip_gap(r_hdr_pos, wire::FIELD_SIZE_TYPE);
                self.buffer.push_ready(buf);
                (PacketKind::Unprotected, false)
            }
            WireType::Protected => self.process_src(buf, now),
            WireType::Coded(scheme) => self.process_cod(buf, scheme, now),
            WireType::Unknown => {
                debug!("dropping packet of unknown type");
                (PacketKind::Unknown, false)
            }
        }
    }

    /// Next packet ready for the QUIC decrypt path, rQUIC header removed.
    pub fn pop_ready(&mut self, now: Instant) -> Option<PacketBuffer> {
        self.buffer.pop_ready(now)
    }

    /// Deadline for the buffer-timeout alarm, if any packet is waiting.
    pub fn next_alarm(&self) -> Option<Instant> {
        self.buffer.alarm()
    }

    /// Raised once more coded packets arrived than any sane sender emits;
    /// the upper layer is expected to close the path.
    pub fn pollution_detected(&self) -> bool {
        self.pollution_seen
    }

    pub fn update_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.buffer.update_max_ack_delay(&self.tuning, max_ack_delay);
    }

    /// Packets buffered for delivery or recovery.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // ----------------------------------------------------------- source path

    fn process_src(&mut self, buf: PacketBuffer, now: Instant) -> (PacketKind, bool) {
        let r_hdr_pos = 1 + self.dcid_len;
        let raw = buf.as_slice();
        if raw.len() < r_hdr_pos + SRC_HEADER_SIZE {
            warn!("{}", FecError::Malformed("truncated SRC header"));
            return (PacketKind::Unknown, false);
        }
        let id = raw[r_hdr_pos + wire::FIELD_POS_ID];
        let last_gen = raw[r_hdr_pos + wire::FIELD_POS_LAST_GEN];
        let overlap = raw[r_hdr_pos + wire::FIELD_POS_OVERLAP];
        if overlap == 0 {
            warn!("{}", FecError::Malformed("SRC overlap of zero"));
            return (PacketKind::Unknown, false);
        }

        self.update_scope(id, last_gen, overlap, id);
        if self.gen_obsolete(last_gen) {
            self.advance_xhold(id.wrapping_add(1));
            return (PacketKind::Obsolete, false);
        }
        if self.is_obsolete_id(id) {
            return (PacketKind::Obsolete, false);
        }
        if self.src_avbl_update(id) {
            debug!("repeated SRC pkt.ID {}", id);
            return (PacketKind::Unknown, false);
        }
        self.pollution += 1.0;

        // SRC record for the coded rows: [len][1st byte][payload tail].
        let lng = raw.len() - (self.dcid_len + SRC_HEADER_SIZE);
        let mut pld = Vec::with_capacity(LEN_OF_SRC_LEN + lng);
        pld.extend_from_slice(&[0, 0]);
        pld_len_write(&mut pld, lng);
        pld.push(raw[0]);
        pld.extend_from_slice(&raw[r_hdr_pos + SRC_HEADER_SIZE..]);
        let src = ParsedSrc { id, pld };

        self.buffer.insert(RxEntry {
            buf,
            id,
            gen: last_gen,
            flags: FLAG_SOURCE,
            rcv_time: now,
            strip: SRC_HEADER_SIZE,
            r_hdr_pos,
        });

        let recovered = self.absorb_src_chain(src, now);
        if recovered {
            self.buffer.order();
        }
        (PacketKind::Protected, recovered)
    }

    // ------------------------------------------------------------ coded path

    fn process_cod(&mut self, buf: PacketBuffer, scheme: Scheme, now: Instant) -> (PacketKind, bool) {
        let r_hdr_pos = 1 + self.dcid_len;
        let raw = buf.as_slice();
        if raw.len() < r_hdr_pos + wire::COD_PRE_HEADER_SIZE {
            warn!("{}", FecError::Malformed("truncated COD header"));
            return (PacketKind::Unknown, false);
        }
        let id = raw[r_hdr_pos + wire::FIELD_POS_ID];
        let gen_id = raw[r_hdr_pos + wire::FIELD_POS_GEN_ID];
        let gen_size = raw[r_hdr_pos + wire::FIELD_POS_GEN_SIZE];
        if gen_size == 0 || gen_size > wire::GEN_SIZE_MAX {
            warn!("{}", FecError::Malformed("COD generation size out of range"));
            return (PacketKind::Unknown, false);
        }

        // The use of different schemes at a time is very unlikely.
        if scheme.code() != self.last_scheme {
            self.unpacker = CoeffUnpacker::new(scheme);
            self.last_scheme = scheme.code();
        }
        let coeff_len = self.unpacker.coeff_wire_len(gen_size as usize);
        let pld_start = r_hdr_pos + wire::FIELD_POS_SEED + coeff_len;
        if raw.len() < pld_start + LEN_OF_SRC_LEN + 1 {
            warn!("{}", FecError::Malformed("COD shorter than its payload header"));
            return (PacketKind::Unknown, false);
        }

        let first_src = id.wrapping_sub(gen_size - 1);
        self.update_scope(id, gen_id, 0, first_src);
        self.pollution -= MIN_RATIO;
        if self.pollution < 0.0 && !self.pollution_seen {
            self.pollution_seen = true;
            error!("{}", FecError::Pollution);
        }
        if self.gen_obsolete(gen_id) {
            self.advance_xhold(id.wrapping_add(1));
            return (PacketKind::Obsolete, false);
        }
        if self.is_obsolete_id(first_src) {
            return (PacketKind::Obsolete, false);
        }

        let coeff = self.unpacker.unpack(raw, r_hdr_pos);
        let src_ids: Vec<u8> = (0..gen_size).map(|k| first_src.wrapping_add(k)).collect();
        let mut cod = ParsedCod {
            id,
            gen_id,
            remaining: gen_size as usize,
            coeff,
            src_ids,
            pld: raw[pld_start..].to_vec(),
            dcid: raw[1..r_hdr_pos].to_vec(),
        };

        self.note_gen_start(gen_id, first_src);
        self.advance_gen_obsolescence();

        // Remove already-received sources from the fresh row.
        for src in &self.pkts_src {
            if let Some(ind) = cod.find_src_id(src.id) {
                cod.remove_src(src, ind);
                cod.coeff[ind] = 0;
            }
        }
        cod.wipe_zeros();

        let mut did_recover = false;
        match cod.remaining {
            0 => debug!("COD pkt.ID {} fully covered, dropped", id),
            1 => {
                if let Some(src) = self.new_src_rec(cod, now) {
                    did_recover = true;
                    self.absorb_src_chain(src, now);
                }
            }
            _ => self.pkts_cod.push(cod),
        }

        for row in self.run_elimination() {
            if let Some(src) = self.new_src_rec(row, now) {
                did_recover = true;
                self.absorb_src_chain(src, now);
            }
        }
        if did_recover {
            self.buffer.order();
        }
        (PacketKind::Coded, did_recover)
    }

    // ------------------------------------------------------- simplification

    /// Subtracts a known SRC from every stored coded row, converting rows
    /// that decay to a single source into recovered SRCs and chaining the
    /// subtraction through them.
    fn absorb_src_chain(&mut self, first: ParsedSrc, now: Instant) -> bool {
        let mut recovered_any = false;
        let mut queue = vec![first];
        while let Some(src) = queue.pop() {
            let mut i = 0;
            while i < self.pkts_cod.len() {
                if let Some(ind) = self.pkts_cod[i].find_src_id(src.id) {
                    let cod = &mut self.pkts_cod[i];
                    cod.remove_src(&src, ind);
                    cod.coeff[ind] = 0;
                    cod.wipe_zeros();
                    match cod.remaining {
                        0 => {
                            self.pkts_cod.swap_remove(i);
                            continue;
                        }
                        1 => {
                            let row = self.pkts_cod.swap_remove(i);
                            if let Some(rec) = self.new_src_rec(row, now) {
                                recovered_any = true;
                                queue.push(rec);
                            }
                            continue;
                        }
                        _ => {}
                    }
                }
                i += 1;
            }
            self.pkts_src.push(src);
        }
        recovered_any
    }

    /// Turns a fully decayed coded row into a recovered SRC: restores the
    /// QUIC packet bytes, hands them to the receive buffer and returns the
    /// record for further simplification.
    fn new_src_rec(&mut self, cod: ParsedCod, now: Instant) -> Option<ParsedSrc> {
        debug_assert!(cod.remaining == 1 && cod.coeff[0] == 1);
        let id = cod.src_ids[0];
        if self.is_obsolete_id(id) {
            return None;
        }
        if self.src_avbl_update(id) {
            return None;
        }
        let pld = cod.pld;
        if pld.len() < LEN_OF_SRC_LEN + 1 {
            warn!("{}", FecError::Malformed("recovered row shorter than a record"));
            return None;
        }
        let lng = pld_len_read(&pld);
        if lng == 0 {
            warn!("{}", FecError::Malformed("recovered record of length zero"));
            return None;
        }
        assert!(
            LEN_OF_SRC_LEN + lng <= pld.len(),
            "decoded length exceeds recovered buffer"
        );

        // [1st byte][DCID][payload tail], truncated to the decoded length.
        let mut buf = self.pool.get();
        let total = 1 + cod.dcid.len() + (lng - 1);
        let data = buf.data_mut();
        if data.len() < total {
            data.resize(total, 0);
        }
        data[0] = pld[LEN_OF_SRC_LEN];
        data[1..1 + cod.dcid.len()].copy_from_slice(&cod.dcid);
        data[1 + cod.dcid.len()..total]
            .copy_from_slice(&pld[LEN_OF_SRC_LEN + 1..LEN_OF_SRC_LEN + lng]);
        buf.set_window(0, total);

        info!("recovered SRC pkt.ID {} gen.ID {}", id, cod.gen_id);
        self.buffer.insert(RxEntry {
            buf,
            id,
            gen: cod.gen_id,
            flags: FLAG_SOURCE | FLAG_CODED,
            rcv_time: now,
            strip: 0,
            r_hdr_pos: 0,
        });
        Some(ParsedSrc { id, pld })
    }

    // --------------------------------------------------- scope & obsolescence

    /// `oldest` is the oldest id the packet vouches for: its own id for a
    /// SRC, the first covered id for a COD. It seeds the obsolescence
    /// threshold on the very first packet.
    fn update_scope(&mut self, pkt: u8, gen: u8, overlap: u8, oldest: u8) {
        if !self.scope_init {
            self.scope_init = true;
            self.last_seen_pkt = pkt;
            self.last_seen_gen = gen;
            self.last_seen_overlap = overlap.max(1);
            self.obsolete_xhold = oldest;
            return;
        }
        if id_older(self.last_seen_pkt, pkt) {
            self.last_seen_pkt = pkt;
        }
        if id_older(self.last_seen_gen, gen) {
            self.last_seen_gen = gen;
        }
        if overlap > 0 {
            self.last_seen_overlap = overlap;
        }
    }

    fn is_obsolete_id(&self, id: u8) -> bool {
        // id == obsolete_xhold is still valid.
        self.scope_init && id_older(id, self.obsolete_xhold)
    }

    /// Oldest generation still worth keeping state for.
    fn gen_threshold(&self) -> u8 {
        self.last_seen_gen
            .wrapping_sub(self.last_seen_overlap.wrapping_add(GEN_MARGIN).wrapping_sub(1))
    }

    fn gen_obsolete(&self, gen: u8) -> bool {
        self.scope_init && id_older(gen, self.gen_threshold())
    }

    /// Monotone advance of the obsolescence threshold; everything older is
    /// released from every list.
    fn advance_xhold(&mut self, new_xhold: u8) {
        if !id_older(self.obsolete_xhold, new_xhold) {
            return;
        }
        debug!(
            "obsolete threshold {} -> {}",
            self.obsolete_xhold, new_xhold
        );
        self.obsolete_xhold = new_xhold;
        let xhold = new_xhold;
        self.pkts_src.retain(|s| !id_older(s.id, xhold));
        self.pkts_cod.retain(|c| !id_older(c.oldest_id(), xhold));
        self.src_avbl.retain(|&i| !id_older(i, xhold));
        self.buffer.drop_obsolete(xhold);
    }

    fn note_gen_start(&mut self, gen: u8, first_src: u8) {
        match self.gen_starts.iter_mut().find(|e| e.0 == gen) {
            Some(entry) => {
                if id_older(first_src, entry.1) {
                    entry.1 = first_src;
                }
            }
            None => self.gen_starts.push((gen, first_src)),
        }
    }

    /// Forgets generations that fell behind the threshold; the oldest
    /// surviving generation's first id bounds the valid packet window.
    fn advance_gen_obsolescence(&mut self) {
        if !self.scope_init {
            return;
        }
        let thr = self.gen_threshold();
        let before = self.gen_starts.len();
        self.gen_starts.retain(|&(g, _)| !id_older(g, thr));
        if self.gen_starts.len() == before {
            return;
        }
        let mut oldest: Option<(u8, u8)> = None;
        for &(g, first) in &self.gen_starts {
            oldest = match oldest {
                Some((og, _)) if !id_older(g, og) => oldest,
                _ => Some((g, first)),
            };
        }
        if let Some((_, first)) = oldest {
            self.advance_xhold(first);
        }
    }

    // ------------------------------------------------------- missing sources

    /// Duplicate detection and ordered insert into the received-id list.
    /// Returns true when the id was already present.
    fn src_avbl_update(&mut self, id: u8) -> bool {
        for i in (0..self.src_avbl.len()).rev() {
            if self.src_avbl[i] == id {
                return true;
            }
            if id_older(self.src_avbl[i], id) {
                self.src_avbl.insert(i + 1, id);
                return false;
            }
        }
        self.src_avbl.insert(0, id);
        false
    }

    /// Rebuilds `src_miss` as `{obsolete_xhold ..= last_seen_pkt} \ src_avbl`.
    pub(crate) fn src_miss_update(&mut self) {
        self.src_miss.clear();
        if !self.scope_init {
            return;
        }
        let xhold = self.obsolete_xhold;
        if !id_older_eq(xhold, self.last_seen_pkt) {
            return;
        }
        self.src_avbl.retain(|&i| !id_older(i, xhold));
        let mut avbl = self.src_avbl.iter().copied().peekable();
        let mut id = xhold;
        loop {
            match avbl.peek() {
                Some(&a) if a == id => {
                    avbl.next();
                }
                _ => self.src_miss.push(id),
            }
            if id == self.last_seen_pkt {
                break;
            }
            id = id.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> Decoder {
        Decoder::new(
            RuntimeTuning::default(),
            BufferPool::new(32, 2048),
            Duration::from_millis(25),
        )
    }

    #[test]
    fn src_avbl_stays_sorted_and_duplicate_free() {
        let mut d = decoder();
        assert!(!d.src_avbl_update(5));
        assert!(!d.src_avbl_update(3));
        assert!(!d.src_avbl_update(9));
        assert!(d.src_avbl_update(5));
        assert_eq!(d.src_avbl, vec![3, 5, 9]);
    }

    #[test]
    fn src_miss_is_the_gap_set() {
        let mut d = decoder();
        d.update_scope(10, 0, 1, 10);
        d.update_scope(15, 0, 1, 15);
        for id in [10, 12, 15] {
            d.src_avbl_update(id);
        }
        d.src_miss_update();
        assert_eq!(d.src_miss, vec![11, 13, 14]);
    }

    #[test]
    fn src_miss_handles_wrap() {
        let mut d = decoder();
        d.update_scope(254, 0, 1, 254);
        d.update_scope(1, 0, 1, 1);
        for id in [254u8, 0] {
            d.src_avbl_update(id);
        }
        d.src_miss_update();
        assert_eq!(d.src_miss, vec![255, 1]);
    }

    #[test]
    fn generation_threshold_follows_the_scenario() {
        let mut d = decoder();
        d.update_scope(100, 10, 1, 100);
        assert!(d.gen_obsolete(8));
        assert!(!d.gen_obsolete(9));
        assert!(!d.gen_obsolete(10));
    }

    #[test]
    fn xhold_advance_is_monotone_and_purges() {
        let mut d = decoder();
        d.update_scope(10, 0, 1, 10);
        d.src_avbl_update(10);
        d.pkts_src.push(ParsedSrc {
            id: 10,
            pld: vec![0, 1, 0],
        });
        d.advance_xhold(12);
        assert_eq!(d.obsolete_xhold, 12);
        assert!(d.pkts_src.is_empty());
        assert!(d.src_avbl.is_empty());
        // Going backwards is refused.
        d.advance_xhold(11);
        assert_eq!(d.obsolete_xhold, 12);
        assert!(d.is_obsolete_id(11));
        assert!(!d.is_obsolete_id(12));
    }
}
