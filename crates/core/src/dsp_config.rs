use serde::{Deserialize, Serialize};

/// The ten ISO-third-octave band centres the parametric EQ operates on.
pub const EQ_BAND_HZ: [u32; 10] = [31, 62, 125, 250, 500, 1000, 2000, 4000, 8000, 16000];

/// Which EQ+Tone processor is active. The three modes are interchangeable
/// implementations of the same combined frequency response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectralMode {
    Iir,
    Fft,
    Fir,
}

impl Default for SpectralMode {
    fn default() -> Self {
        SpectralMode::Iir
    }
}

/// Per-device DSP configuration. This is the flat map described by the
/// config store schema: ten EQ band gains plus tone, compressor and stereo
/// parameters. `Default` is the neutral/identity configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DspConfig {
    pub eq_enabled: bool,
    /// Gain in dB for each of [`EQ_BAND_HZ`], same order.
    pub eq_gains_db: [f32; 10],

    pub spectral_enabled: bool,
    pub spectral_mode: SpectralMode,
    /// Linear gain multiplier, 0.5-2.0, applied to the low-shelf / bass region.
    pub lowfreq_gain: f32,
    /// Linear gain multiplier, 0.5-2.0, applied to the high-shelf / treble region.
    pub highfreq_gain: f32,

    pub use_compression: bool,
    pub compressor_threshold: f32,
    pub compressor_ratio: f32,
    pub compressor_makeup: f32,

    pub use_stereo: bool,
    pub stereo_width: f32,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            eq_enabled: false,
            eq_gains_db: [0.0; 10],
            spectral_enabled: false,
            spectral_mode: SpectralMode::Iir,
            lowfreq_gain: 1.0,
            highfreq_gain: 1.0,
            use_compression: false,
            compressor_threshold: 0.8,
            compressor_ratio: 1.0,
            compressor_makeup: 1.0,
            use_stereo: false,
            stereo_width: 1.0,
        }
    }
}

impl DspConfig {
    /// Merge recognized fields from a JSON patch, ignoring unknown keys.
    /// Mirrors the "dynamic kwargs map to a typed record with `update`"
    /// design note: unrecognized fields never cause an error, they are
    /// simply dropped.
    pub fn merge(&mut self, patch: &serde_json::Value) {
        let obj = match patch.as_object() {
            Some(o) => o,
            None => return,
        };
        macro_rules! bool_field {
            ($key:literal, $field:ident) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_bool()) {
                    self.$field = v;
                }
            };
        }
        macro_rules! f32_field {
            ($key:literal, $field:ident) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_f64()) {
                    self.$field = v as f32;
                }
            };
        }

        bool_field!("eq_enabled", eq_enabled);
        bool_field!("spectral_enabled", spectral_enabled);
        bool_field!("use_compression", use_compression);
        bool_field!("use_stereo", use_stereo);
        f32_field!("lowfreq_gain", lowfreq_gain);
        f32_field!("highfreq_gain", highfreq_gain);
        f32_field!("compressor_threshold", compressor_threshold);
        f32_field!("compressor_ratio", compressor_ratio);
        f32_field!("compressor_makeup", compressor_makeup);
        f32_field!("stereo_width", stereo_width);

        if let Some(mode) = obj.get("spectral_mode").and_then(|v| v.as_str()) {
            self.spectral_mode = match mode {
                "fft" => SpectralMode::Fft,
                "fir" => SpectralMode::Fir,
                _ => SpectralMode::Iir,
            };
        }

        for (i, hz) in EQ_BAND_HZ.iter().enumerate() {
            let key = format!("eq_{hz}");
            if let Some(v) = obj.get(&key).and_then(|v| v.as_f64()) {
                self.eq_gains_db[i] = v as f32;
            }
        }
    }

    /// True when every parameter is at its neutral value: `process(B) == B`
    /// must hold for a DSP graph configured this way.
    pub fn is_identity(&self) -> bool {
        !self.eq_enabled
            && !self.spectral_enabled
            && !self.use_compression
            && !self.use_stereo
            && (self.lowfreq_gain - 1.0).abs() < f32::EPSILON
            && (self.highfreq_gain - 1.0).abs() < f32::EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_identity() {
        assert!(DspConfig::default().is_identity());
    }

    #[test]
    fn merge_ignores_unknown_keys() {
        let mut cfg = DspConfig::default();
        cfg.merge(&serde_json::json!({"eq_enabled": true, "bogus_field": 42}));
        assert!(cfg.eq_enabled);
    }

    #[test]
    fn merge_eq_band() {
        let mut cfg = DspConfig::default();
        cfg.merge(&serde_json::json!({"eq_1000": 6.0}));
        assert_eq!(cfg.eq_gains_db[5], 6.0);
    }
}
