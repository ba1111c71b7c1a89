//! Systematic random linear coding. Every staged SRC draws one fresh
//! non-zero coefficient per redundancy lane; each lane accumulates the
//! GF(2^8) linear combination `sum(coeff_i * src_i)` in place. The lanes
//! share one generation but carry independent coefficient vectors.

use super::{seal_lane, PREFIX_RESERVE};
use crate::buffer::{BufferPool, PacketBuffer};
use crate::gf;
use crate::wire::{Scheme, MAX_GF};
use rand::rngs::StdRng;
use rand::Rng;

struct Lane {
    buf: PacketBuffer,
    coeffs: Vec<u8>,
}

pub(crate) struct RlcSysBuilder {
    lanes: Vec<Lane>,
    prefix: Vec<u8>,
    payload_len: usize,
    gen_size: u8,
    reduns: u8,
}

fn new_coeff(rng: &mut StdRng) -> u8 {
    rng.gen_range(1..=MAX_GF)
}

impl RlcSysBuilder {
    pub fn new(reduns: u8, pool: &BufferPool) -> RlcSysBuilder {
        let lanes = (0..reduns.max(1))
            .map(|_| Lane {
                buf: pool.get(),
                coeffs: Vec::new(),
            })
            .collect();
        RlcSysBuilder {
            lanes,
            prefix: Vec::new(),
            payload_len: 0,
            gen_size: 0,
            reduns: reduns.max(1),
        }
    }

    pub fn gen_size(&self) -> u8 {
        self.gen_size
    }

    pub fn reduns(&self) -> u8 {
        self.reduns
    }

    pub fn add_src(&mut self, src: &[u8], prefix: &[u8], rng: &mut StdRng) {
        for lane in &mut self.lanes {
            let cf = new_coeff(rng);
            lane.coeffs.push(cf);
            let data = lane.buf.data_mut();
            let end = PREFIX_RESERVE + src.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            for (i, &v) in src.iter().enumerate() {
                data[PREFIX_RESERVE + i] ^= gf::mul(v, cf);
            }
        }
        if src.len() > self.payload_len {
            self.payload_len = src.len();
        }
        self.prefix.clear();
        self.prefix.extend_from_slice(prefix);
        self.gen_size += 1;
    }

    pub fn finish(self, pkt_id: u8, gen_id: u8) -> Vec<PacketBuffer> {
        let prefix = self.prefix;
        let gen_size = self.gen_size;
        let payload_len = self.payload_len;
        self.lanes
            .into_iter()
            .map(|mut lane| {
                seal_lane(
                    &mut lane.buf,
                    Scheme::RlcSys,
                    &prefix,
                    &lane.coeffs,
                    pkt_id,
                    gen_id,
                    gen_size,
                    payload_len,
                );
                lane.buf
            })
            .collect()
    }
}
