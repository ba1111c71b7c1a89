//! XOR scheme: one coded packet per generation, the bitwise XOR of all
//! staged SRC records (length-padded). Coefficients are implicit all-ones,
//! so nothing is spent on a seed field.

use super::{seal_lane, PREFIX_RESERVE};
use crate::buffer::{BufferPool, PacketBuffer};
use crate::wire::Scheme;

pub(crate) struct XorBuilder {
    buf: PacketBuffer,
    /// First byte + DCID of the newest staged SRC.
    prefix: Vec<u8>,
    payload_len: usize,
    gen_size: u8,
}

impl XorBuilder {
    pub fn new(pool: &BufferPool) -> XorBuilder {
        XorBuilder {
            buf: pool.get(),
            prefix: Vec::new(),
            payload_len: 0,
            gen_size: 0,
        }
    }

    pub fn gen_size(&self) -> u8 {
        self.gen_size
    }

    pub fn add_src(&mut self, src: &[u8], prefix: &[u8]) {
        let data = self.buf.data_mut();
        let end = PREFIX_RESERVE + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        for (i, &v) in src.iter().enumerate() {
            data[PREFIX_RESERVE + i] ^= v;
        }
        if src.len() > self.payload_len {
            self.payload_len = src.len();
        }
        self.prefix.clear();
        self.prefix.extend_from_slice(prefix);
        self.gen_size += 1;
    }

    pub fn finish(mut self, pkt_id: u8, gen_id: u8) -> Vec<PacketBuffer> {
        seal_lane(
            &mut self.buf,
            Scheme::Xor,
            &self.prefix,
            &[],
            pkt_id,
            gen_id,
            self.gen_size,
            self.payload_len,
        );
        vec![self.buf]
    }
}
