//! rQUIC forward error correction core.
//!
//! Adds in-network FEC to a QUIC transport: the sender tags ack-eliciting
//! packets as protected sources, folds them into sliding generations and
//! emits coded packets (GF(2^8) linear combinations) so the receiver can
//! reconstruct losses without end-to-end retransmissions.
//!
//! Sender side:
//!
//! ```text
//! QUIC-packed frame -> Encoder::process -> raw buffer with rQUIC SRC hdr
//!                                      \-> (generation close) coded packets -> send queue
//! ```
//!
//! Receiver side:
//!
//! ```text
//! UDP datagram -> Decoder::process -> {Unprotected, Protected, Coded, Unknown, Obsolete}
//!                                 \-> receive buffer (ordering, timeout) -> Decoder::pop_ready
//! ```
//!
//! The crate deliberately stops at the FEC boundary: handshake, crypto,
//! congestion control, ACK parsing and UDP I/O stay with the QUIC stack,
//! which feeds the encoder through [`TransportInfo`] and
//! [`Encoder::ack_processed`].

mod buffer;
mod config;
mod decoder;
mod encoder;
mod error;
mod gf;
mod schemes;
mod tuning;
mod wire;

pub use buffer::{BufferPool, PacketBuffer};
pub use config::{CConf, CConfJson, Conf, ConfJson};
pub use decoder::{Decoder, PacketKind};
pub use encoder::{Encoder, TransportInfo};
pub use error::{FecError, Result};
pub use tuning::{PauseEncoding, RuntimeTuning, TIMER_GRANULARITY};
pub use wire::{Scheme, GEN_SIZE_MAX, MAX_RATIO, MIN_RATIO, OVERHEAD_MAX, SRC_HEADER_SIZE};
