//! Coding configuration.
//!
//! `CConf` is the in-memory record consumed by the encoder; `ConfJson` is
//! the externally supplied JSON mirror. Zero-valued fields are populated
//! from the GLOBECOM'19 template.

use crate::error::{FecError, Result};
use crate::wire::Scheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;

impl Scheme {
    pub fn from_name(name: &str) -> Option<Scheme> {
        match name {
            "SchemeXor" => Some(Scheme::Xor),
            "SchemeRlcSys" => Some(Scheme::RlcSys),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scheme::Xor => "SchemeXor",
            Scheme::RlcSys => "SchemeRlcSys",
        }
    }
}

/// Coding options recognized by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CConf {
    pub scheme: Scheme,
    /// Generations a SRC simultaneously belongs to (convolutional coding).
    pub overlap: u8,
    /// Coded packets emitted per closed generation per scheme slot.
    pub reduns: u8,
    /// Initial SRC/COD ratio.
    pub ratio_val: f64,
    /// 1: dynamic; 0: default; -1: static.
    pub dynamic: i8,
    /// Duration of one measurement period. Zero means 3 x sRTT.
    pub t_period: Duration,
    /// EWMA window length.
    pub num_periods: usize,
    /// Residual-loss target.
    pub gamma_target: f64,
    /// Ratio multiplicative step, in (0, 1).
    pub delta_ratio: f64,
}

impl Default for CConf {
    /// Template from 10.1109/GLOBECOM38437.2019.9013401. TPeriod is 3 x RTT
    /// with the paper's 25 ms reference; with a live connection leave it at
    /// zero and the encoder takes 3 x sRTT instead.
    fn default() -> Self {
        CConf {
            scheme: Scheme::Xor,
            overlap: 1,
            reduns: 1,
            ratio_val: 10.0,
            dynamic: 1,
            t_period: Duration::from_millis(3 * 25),
            num_periods: 3,
            gamma_target: 0.01,
            delta_ratio: 0.33,
        }
    }
}

impl CConf {
    /// Fills zero-valued fields from the default template.
    pub fn populate(&mut self) {
        let d = CConf::default();
        if self.overlap == 0 {
            self.overlap = d.overlap;
        }
        if self.reduns == 0 {
            self.reduns = d.reduns;
        }
        if self.ratio_val == 0.0 {
            self.ratio_val = d.ratio_val;
        }
        if self.num_periods == 0 {
            self.num_periods = d.num_periods;
        }
        if self.gamma_target == 0.0 {
            self.gamma_target = d.gamma_target;
        }
        if self.delta_ratio == 0.0 {
            self.delta_ratio = d.delta_ratio;
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic >= 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.overlap < 1 {
            return Err(FecError::Config("Overlap must be >= 1".into()));
        }
        if self.reduns < 1 {
            return Err(FecError::Config("Reduns must be >= 1".into()));
        }
        if self.ratio_val <= 0.0 {
            return Err(FecError::Config("RatioVal must be > 0".into()));
        }
        if !(-1..=1).contains(&self.dynamic) {
            return Err(FecError::Config("Dynamic must be -1, 0 or 1".into()));
        }
        if self.num_periods < 1 {
            return Err(FecError::Config("NumPeriods must be >= 1".into()));
        }
        if self.gamma_target <= 0.0 {
            return Err(FecError::Config("GammaTarget must be > 0".into()));
        }
        if self.delta_ratio <= 0.0 || self.delta_ratio >= 1.0 {
            return Err(FecError::Config("DeltaRatio must be in (0, 1)".into()));
        }
        Ok(())
    }
}

/// Top-level switchboard for one connection.
#[derive(Debug, Clone, Default)]
pub struct Conf {
    pub enable_encoder: bool,
    pub enable_decoder: bool,
    pub coding_conf: Option<CConf>,
}

impl Conf {
    pub fn populate(&mut self) {
        if !self.enable_encoder {
            return;
        }
        match self.coding_conf.as_mut() {
            Some(c) => c.populate(),
            None => self.coding_conf = Some(CConf::default()),
        }
    }

    pub fn default_both() -> Conf {
        Conf {
            enable_encoder: true,
            enable_decoder: true,
            coding_conf: Some(CConf::default()),
        }
    }

    pub fn tx_only() -> Conf {
        Conf {
            enable_encoder: true,
            enable_decoder: false,
            coding_conf: Some(CConf::default()),
        }
    }

    pub fn rx_only() -> Conf {
        Conf {
            enable_encoder: false,
            enable_decoder: true,
            coding_conf: Some(CConf::default()),
        }
    }

    pub fn from_json(s: &str) -> Result<Conf> {
        let json: ConfJson =
            serde_json::from_str(s).map_err(|e| FecError::Config(e.to_string()))?;
        json.try_into()
    }

    pub fn to_json(&self) -> String {
        let json = ConfJson::from(self);
        serde_json::to_string(&json).expect("ConfJson serialization cannot fail")
    }
}

/// JSON mirror of [`Conf`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfJson {
    #[serde(rename = "EnableEncoder", default)]
    pub enable_encoder: bool,
    #[serde(rename = "EnableDecoder", default)]
    pub enable_decoder: bool,
    #[serde(rename = "CConfJson", default, skip_serializing_if = "Option::is_none")]
    pub coding_conf: Option<CConfJson>,
}

/// JSON mirror of [`CConf`]. `TPeriodMS` is integer milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CConfJson {
    #[serde(rename = "Scheme", default)]
    pub scheme: String,
    #[serde(rename = "Overlap", default)]
    pub overlap: u8,
    #[serde(rename = "Reduns", default)]
    pub reduns: u8,
    #[serde(rename = "RatioVal", default)]
    pub ratio_val: f64,
    #[serde(rename = "Dynamic", default)]
    pub dynamic: i8,
    #[serde(rename = "TPeriodMS", default)]
    pub t_period_ms: u64,
    #[serde(rename = "NumPeriods", default)]
    pub num_periods: usize,
    #[serde(rename = "GammaTarget", default)]
    pub gamma_target: f64,
    #[serde(rename = "DeltaRatio", default)]
    pub delta_ratio: f64,
}

impl TryFrom<ConfJson> for Conf {
    type Error = FecError;

    fn try_from(json: ConfJson) -> Result<Conf> {
        let coding_conf = match json.coding_conf {
            None => None,
            Some(c) => {
                let scheme = if c.scheme.is_empty() {
                    CConf::default().scheme
                } else {
                    Scheme::from_name(&c.scheme).ok_or_else(|| {
                        FecError::Config(format!("unknown scheme {:?}", c.scheme))
                    })?
                };
                let mut cc = CConf {
                    scheme,
                    overlap: c.overlap,
                    reduns: c.reduns,
                    ratio_val: c.ratio_val,
                    dynamic: c.dynamic,
                    t_period: Duration::from_millis(c.t_period_ms),
                    num_periods: c.num_periods,
                    gamma_target: c.gamma_target,
                    delta_ratio: c.delta_ratio,
                };
                cc.populate();
                Some(cc)
            }
        };
        let mut conf = Conf {
            enable_encoder: json.enable_encoder,
            enable_decoder: json.enable_decoder,
            coding_conf,
        };
        conf.populate();
        Ok(conf)
    }
}

impl From<&Conf> for ConfJson {
    fn from(conf: &Conf) -> ConfJson {
        ConfJson {
            enable_encoder: conf.enable_encoder,
            enable_decoder: conf.enable_decoder,
            coding_conf: conf.coding_conf.as_ref().map(|c| CConfJson {
                scheme: c.scheme.name().to_string(),
                overlap: c.overlap,
                reduns: c.reduns,
                ratio_val: c.ratio_val,
                dynamic: c.dynamic,
                t_period_ms: c.t_period.as_millis() as u64,
                num_periods: c.num_periods,
                gamma_target: c.gamma_target,
                delta_ratio: c.delta_ratio,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_is_valid() {
        CConf::default().validate().unwrap();
    }

    #[test]
    fn populate_fills_zero_fields() {
        let mut c = CConf {
            scheme: Scheme::RlcSys,
            overlap: 0,
            reduns: 0,
            ratio_val: 0.0,
            dynamic: -1,
            t_period: Duration::ZERO,
            num_periods: 0,
            gamma_target: 0.0,
            delta_ratio: 0.0,
        };
        c.populate();
        assert_eq!(c.scheme, Scheme::RlcSys);
        assert_eq!(c.overlap, 1);
        assert_eq!(c.reduns, 1);
        assert_eq!(c.ratio_val, 10.0);
        assert_eq!(c.dynamic, -1);
        assert_eq!(c.num_periods, 3);
        c.validate().unwrap();
    }

    #[test]
    fn json_round_trip() {
        let input = r#"{
            "EnableEncoder": true,
            "EnableDecoder": true,
            "CConfJson": {
                "Scheme": "SchemeRlcSys",
                "Overlap": 1,
                "Reduns": 2,
                "RatioVal": 8.0,
                "Dynamic": 1,
                "TPeriodMS": 75,
                "NumPeriods": 3,
                "GammaTarget": 0.01,
                "DeltaRatio": 0.33
            }
        }"#;
        let conf = Conf::from_json(input).unwrap();
        let cc = conf.coding_conf.as_ref().unwrap();
        assert_eq!(cc.scheme, Scheme::RlcSys);
        assert_eq!(cc.reduns, 2);
        assert_eq!(cc.t_period, Duration::from_millis(75));

        let back = Conf::from_json(&conf.to_json()).unwrap();
        assert_eq!(back.coding_conf, conf.coding_conf);
    }

    #[test]
    fn unknown_scheme_rejected() {
        let input = r#"{"EnableEncoder": true, "CConfJson": {"Scheme": "SchemeBats"}}"#;
        assert!(Conf::from_json(input).is_err());
    }

    #[test]
    fn validation_rejects_bad_delta() {
        let mut c = CConf::default();
        c.delta_ratio = 1.5;
        assert!(c.validate().is_err());
    }
}
