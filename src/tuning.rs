//! Operational tunables, passed by reference to the encoder and the receive
//! buffer instead of living in process-wide globals.

use std::time::Duration;

/// Smallest timer step the receive buffer works with.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// When the encoder holds back coded packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseEncoding {
    #[default]
    Never,
    TillFirstLoss,
    WithResidualLoss,
}

#[derive(Debug, Clone)]
pub struct RuntimeTuning {
    /// Timer granularities subtracted from maxAckDelay to get the BTO.
    pub bto_margin: u32,
    /// Bypass the straggler-generation rule, release on BTO only.
    pub bto_only: bool,
    pub pause_encoding: PauseEncoding,
    /// With `PauseEncoding::WithResidualLoss`, coding resumes once the
    /// residual loss exceeds `gamma_target * res_loss_factor`.
    pub res_loss_factor: f64,
    /// Cap the coding rate by the receiver's buffering headroom.
    pub lim_rate_to_dec_buffer: bool,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        RuntimeTuning {
            bto_margin: 1,
            bto_only: false,
            pause_encoding: PauseEncoding::Never,
            res_loss_factor: 0.0,
            lim_rate_to_dec_buffer: false,
        }
    }
}

impl RuntimeTuning {
    /// Buffer timeout derived from the peer's maxAckDelay:
    /// `max(maxAckDelay - BTOMargin * granularity, granularity)`.
    pub fn buffer_timeout(&self, max_ack_delay: Duration) -> Duration {
        let margin = TIMER_GRANULARITY * self.bto_margin;
        max_ack_delay
            .checked_sub(margin)
            .unwrap_or(TIMER_GRANULARITY)
            .max(TIMER_GRANULARITY)
    }
}
