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

//! Coding schemes.
//!
//! A [`RedunBuilder`] accumulates the SRC records of one generation and
//! seals them into finished coded packets; a [`CoeffUnpacker`] recovers the
//! coefficient vector from a received coded packet. The scheme set is closed
//! and small, so both are sum types with one variant per scheme.

mod rlc;
mod xor;

pub(crate) use rlc::RlcSysBuilder;
pub(crate) use xor::XorBuilder;

use crate::buffer::{BufferPool, PacketBuffer};
use crate::wire::{self, Scheme};
use rand::rngs::StdRng;

/// Bytes reserved in front of the staged coded payload for the largest
/// possible prefix: first byte, DCID, pre-header and a full coefficient
/// vector. `finish` writes the actual prefix flush against the payload and
/// windows the buffer past the unused slack.
pub(crate) const PREFIX_RESERVE: usize =
    1 + wire::MAX_DCID_LEN + wire::COD_PRE_HEADER_SIZE + wire::GEN_SIZE_MAX as usize;

/// Builder for the coded packets of one generation.
pub(crate) enum RedunBuilder {
    Xor(XorBuilder),
    RlcSys(RlcSysBuilder),
}

impl RedunBuilder {
    pub fn new(scheme: Scheme, reduns: u8, pool: &BufferPool) -> RedunBuilder {
        match scheme {
            // XOR carries exactly one redundant packet per generation.
            Scheme::Xor => RedunBuilder::Xor(XorBuilder::new(pool)),
            Scheme::RlcSys => RedunBuilder::RlcSys(RlcSysBuilder::new(reduns, pool)),
        }
    }

    pub fn reduns(&self) -> u8 {
        match self {
            RedunBuilder::Xor(_) => 1,
            RedunBuilder::RlcSys(b) => b.reduns(),
        }
    }

    pub fn gen_size(&self) -> u8 {
        match self {
            RedunBuilder::Xor(b) => b.gen_size(),
            RedunBuilder::RlcSys(b) => b.gen_size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gen_size() == 0
    }

    /// Folds one SRC record into every redundancy lane. `prefix` is the
    /// first byte + DCID of the packet being staged; the newest one becomes
    /// the coded packets' own prefix.
    pub fn add_src(&mut self, src: &[u8], prefix: &[u8], rng: &mut StdRng) {
        match self {
            RedunBuilder::Xor(b) => b.add_src(src, prefix),
            RedunBuilder::RlcSys(b) => b.add_src(src, prefix, rng),
        }
    }

    pub fn ready_to_send(&self, ratio: f64) -> bool {
        let gen_size = self.gen_size();
        if gen_size >= wire::GEN_SIZE_MAX {
            return true;
        }
        gen_size as f64 / self.reduns() as f64 >= ratio
    }

    /// Seals the generation: stamps the pre-header with `pkt_id`/`gen_id`,
    /// shifts coefficients flush against the coded payload and returns the
    /// finished packets, one per redundancy lane.
    pub fn finish(self, pkt_id: u8, gen_id: u8) -> Vec<PacketBuffer> {
        match self {
            RedunBuilder::Xor(b) => b.finish(pkt_id, gen_id),
            RedunBuilder::RlcSys(b) => b.finish(pkt_id, gen_id),
        }
    }

    /// Largest seed/coefficient field this builder can put on the wire.
    pub fn seed_max_field_size(&self) -> usize {
        match self {
            RedunBuilder::Xor(_) => 0,
            RedunBuilder::RlcSys(_) => wire::GEN_SIZE_MAX as usize,
        }
    }
}

/// Recovers the coefficient vector of a received coded packet.
pub(crate) enum CoeffUnpacker {
    Xor,
    RlcSys,
}

impl CoeffUnpacker {
    pub fn new(scheme: Scheme) -> CoeffUnpacker {
        match scheme {
            Scheme::Xor => CoeffUnpacker::Xor,
            Scheme::RlcSys => CoeffUnpacker::RlcSys,
        }
    }

    /// One coefficient per covered SRC, `genSize` of them.
    pub fn unpack(&self, raw: &[u8], r_hdr_pos: usize) -> Vec<u8> {
        let gen_size = raw[r_hdr_pos + wire::FIELD_POS_GEN_SIZE] as usize;
        match self {
            CoeffUnpacker::Xor => vec![1u8; gen_size],
            CoeffUnpacker::RlcSys => {
                let start = r_hdr_pos + wire::FIELD_POS_SEED;
                raw[start..start + gen_size].to_vec()
            }
        }
    }

    /// Bytes the coefficient field occupies on the wire; negative outputs
    /// are genSize multipliers.
    pub fn coeff_field_size(&self) -> isize {
        match self {
            CoeffUnpacker::Xor => 0,
            CoeffUnpacker::RlcSys => -1,
        }
    }

    /// Wire bytes consumed by the coefficient field of a COD covering
    /// `gen_size` sources.
    pub fn coeff_wire_len(&self, gen_size: usize) -> usize {
        let cfs = self.coeff_field_size();
        if cfs < 0 {
            (-cfs) as usize * gen_size
        } else {
            cfs as usize
        }
    }
}

/// Writes `prefix | [type, pkt_id, gen_id, gen_size] | coeffs` backwards
/// from `payload_start` and windows the buffer over the finished packet.
pub(crate) fn seal_lane(
    buf: &mut PacketBuffer,
    scheme: Scheme,
    prefix: &[u8],
    coeffs: &[u8],
    pkt_id: u8,
    gen_id: u8,
    gen_size: u8,
    payload_len: usize,
) {
    let coeff_start = PREFIX_RESERVE - coeffs.len();
    let hdr_start = coeff_start - wire::COD_PRE_HEADER_SIZE;
    let prefix_start = hdr_start - prefix.len();

    let data = buf.data_mut();
    data[prefix_start..hdr_start].copy_from_slice(prefix);
    data[hdr_start + wire::FIELD_POS_TYPE] = scheme.cod_type();
    data[hdr_start + wire::FIELD_POS_ID] = pkt_id;
    data[hdr_start + wire::FIELD_POS_GEN_ID] = gen_id;
    data[hdr_start + wire::FIELD_POS_GEN_SIZE] = gen_size;
    data[coeff_start..PREFIX_RESERVE].copy_from_slice(coeffs);

    buf.set_window(prefix_start, PREFIX_RESERVE + payload_len - prefix_start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn src_record(len: usize, fill: u8) -> Vec<u8> {
        let mut rec = vec![0u8; len];
        wire::pld_len_write(&mut rec, len - 2);
        rec[2..].iter_mut().for_each(|b| *b = fill);
        rec
    }

    #[test]
    fn xor_generation_of_one_equals_the_src() {
        let pool = BufferPool::new(4, 512);
        let mut rng = StdRng::seed_from_u64(7);
        let mut rb = RedunBuilder::new(Scheme::Xor, 1, &pool);
        let prefix = [0xC3u8, 1, 2, 3, 4];
        let rec = src_record(10, 0x5A);
        rb.add_src(&rec, &prefix, &mut rng);
        assert!(rb.ready_to_send(1.0));

        let pkts = rb.finish(42, 7);
        assert_eq!(pkts.len(), 1);
        let cod = pkts[0].as_slice();
        assert_eq!(&cod[..prefix.len()], &prefix);
        let hdr = &cod[prefix.len()..];
        assert_eq!(hdr[wire::FIELD_POS_TYPE], Scheme::Xor.cod_type());
        assert_eq!(hdr[wire::FIELD_POS_ID], 42);
        assert_eq!(hdr[wire::FIELD_POS_GEN_ID], 7);
        assert_eq!(hdr[wire::FIELD_POS_GEN_SIZE], 1);
        // No coefficient field, payload equals the staged record.
        assert_eq!(&hdr[wire::COD_PRE_HEADER_SIZE..], &rec[..]);
    }

    #[test]
    fn xor_payload_is_the_xor_of_all_records() {
        let pool = BufferPool::new(4, 512);
        let mut rng = StdRng::seed_from_u64(7);
        let mut rb = RedunBuilder::new(Scheme::Xor, 1, &pool);
        let prefix = [0x40u8, 9];
        let a = src_record(8, 0x0F);
        let b = src_record(12, 0xF0);
        rb.add_src(&a, &prefix, &mut rng);
        rb.add_src(&b, &prefix, &mut rng);

        let pkts = rb.finish(1, 0);
        let cod = pkts[0].as_slice();
        let pld = &cod[prefix.len() + wire::COD_PRE_HEADER_SIZE..];
        assert_eq!(pld.len(), 12);
        for i in 0..12 {
            let want = a.get(i).copied().unwrap_or(0) ^ b.get(i).copied().unwrap_or(0);
            assert_eq!(pld[i], want, "byte {i}");
        }
    }

    #[test]
    fn rlc_lanes_carry_independent_coefficients() {
        let pool = BufferPool::new(8, 512);
        let mut rng = StdRng::seed_from_u64(99);
        let mut rb = RedunBuilder::new(Scheme::RlcSys, 2, &pool);
        let prefix = [0x51u8, 3, 3];
        for fill in [1u8, 2, 3, 4] {
            rb.add_src(&src_record(16, fill), &prefix, &mut rng);
        }
        // genSize/reduns = 2 >= ratio 2
        assert!(rb.ready_to_send(2.0));

        let pkts = rb.finish(23, 5);
        assert_eq!(pkts.len(), 2);
        let mut seen = Vec::new();
        for p in &pkts {
            let raw = p.as_slice();
            let hdr = &raw[prefix.len()..];
            assert_eq!(hdr[wire::FIELD_POS_TYPE], Scheme::RlcSys.cod_type());
            assert_eq!(hdr[wire::FIELD_POS_GEN_SIZE], 4);
            let coeffs = &hdr[wire::FIELD_POS_SEED..wire::FIELD_POS_SEED + 4];
            assert!(coeffs.iter().all(|&c| c != 0));
            seen.push(coeffs.to_vec());
        }
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn ready_fires_at_gen_size_max() {
        let pool = BufferPool::new(4, 2048);
        let mut rng = StdRng::seed_from_u64(0);
        let mut rb = RedunBuilder::new(Scheme::Xor, 1, &pool);
        let prefix = [0u8; 5];
        let rec = src_record(4, 1);
        for _ in 0..wire::GEN_SIZE_MAX {
            assert!(!rb.ready_to_send(wire::MAX_RATIO + 1.0));
            rb.add_src(&rec, &prefix, &mut rng);
        }
        assert!(rb.ready_to_send(wire::MAX_RATIO + 1.0));
    }

    #[test]
    fn unpacker_field_sizes() {
        assert_eq!(CoeffUnpacker::new(Scheme::Xor).coeff_field_size(), 0);
        assert_eq!(CoeffUnpacker::new(Scheme::RlcSys).coeff_field_size(), -1);
        assert_eq!(CoeffUnpacker::new(Scheme::RlcSys).coeff_wire_len(7), 7);
        assert_eq!(CoeffUnpacker::new(Scheme::Xor).coeff_wire_len(7), 0);
    }
}
