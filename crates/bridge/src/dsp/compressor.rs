/// Compressor — time-domain, memoryless dynamic range compression.
///
/// For `|x| > threshold`: `out = sign(x) * (threshold + (|x| - threshold) / ratio) * makeup`,
/// clipped to `[-1, 1]`. Below threshold the sample passes through unchanged
/// (aside from `makeup`, which is applied uniformly so the transition at the
/// threshold is continuous).
pub struct Compressor {
    enabled: bool,
    threshold: f32,
    ratio: f32,
    makeup: f32,
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            enabled: false,
            threshold: 0.8,
            ratio: 1.0,
            makeup: 1.0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_params(&mut self, threshold: f32, ratio: f32, makeup: f32) {
        self.threshold = threshold.clamp(0.0, 1.0);
        self.ratio = ratio.max(1.0);
        self.makeup = makeup.max(1.0);
    }

    /// Process audio buffer in-place. Memoryless: no state to preserve
    /// across calls, so there is nothing `reset()` needs to touch beyond
    /// parameters, which callers change via `set_params`.
    pub fn process(&mut self, buffer: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    #[inline]
    fn process_sample(&self, x: f32) -> f32 {
        let abs_x = x.abs();
        if abs_x > self.threshold {
            let compressed = self.threshold + (abs_x - self.threshold) / self.ratio;
            (x.signum() * compressed * self.makeup).clamp(-1.0, 1.0)
        } else {
            x
        }
    }

    /// No-op: the compressor carries no internal state between samples.
    pub fn reset(&mut self) {}
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_is_passthrough() {
        let mut c = Compressor::new();
        let mut buf = vec![0.9, -0.9, 0.1];
        let original = buf.clone();
        c.process(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn matches_spec_formula() {
        let mut c = Compressor::new();
        c.set_enabled(true);
        c.set_params(0.3, 4.0, 1.0);
        let mut buf = vec![0.6];
        c.process(&mut buf);
        assert!((buf[0] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn below_threshold_unchanged() {
        let mut c = Compressor::new();
        c.set_enabled(true);
        c.set_params(0.8, 4.0, 1.0);
        let mut buf = vec![0.2, -0.3];
        c.process(&mut buf);
        assert_eq!(buf, vec![0.2, -0.3]);
    }

    #[test]
    fn output_always_clipped() {
        let mut c = Compressor::new();
        c.set_enabled(true);
        c.set_params(0.1, 1.0, 3.0);
        let mut buf = vec![0.9, -0.9];
        c.process(&mut buf);
        for s in buf {
            assert!(s.abs() <= 1.0);
        }
    }
}
