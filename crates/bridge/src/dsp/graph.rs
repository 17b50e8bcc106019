/// DSP graph orchestrator: EQ+Tone -> Compressor -> Stereo Widener.
///
/// One `DspGraph` per device. `apply_config` never resets filter state on
/// its own — only `reset()` does — so parameter edits made while audio is
/// flowing do not click.
use crate::dsp::compressor::Compressor;
use crate::dsp::eq::EqProcessor;
use crate::dsp::spectral::{FftSpectralEq, FirSpectralEq};
use crate::dsp::stereo_width::StereoWidth;
use airbridge_core::{DspConfig, SpectralMode};

pub struct DspGraph {
    channels: usize,
    iir_eq: EqProcessor,
    fft_eq: FftSpectralEq,
    fir_eq: FirSpectralEq,
    compressor: Compressor,
    stereo: StereoWidth,
    mode: SpectralMode,
}

impl DspGraph {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            channels,
            iir_eq: EqProcessor::new(sample_rate, channels),
            fft_eq: FftSpectralEq::new(sample_rate, channels),
            fir_eq: FirSpectralEq::new(sample_rate, channels),
            compressor: Compressor::new(),
            stereo: StereoWidth::new(),
            mode: SpectralMode::Iir,
        }
    }

    /// Apply a `DspConfig` to every stage. State carries across calls; only
    /// `reset()` clears it.
    pub fn apply_config(&mut self, config: &DspConfig) {
        self.mode = config.spectral_mode;

        let eq_active = config.eq_enabled || config.spectral_enabled;
        self.iir_eq.set_enabled(eq_active && matches!(self.mode, SpectralMode::Iir));
        self.fft_eq.set_enabled(eq_active && matches!(self.mode, SpectralMode::Fft));
        self.fir_eq.set_enabled(eq_active && matches!(self.mode, SpectralMode::Fir));

        // Tone shelves in IIR mode are folded into the EQ cascade; in
        // FFT/FIR mode the tilt curve is baked into the combined response.
        let low_shelf_db = 20.0 * config.lowfreq_gain.max(1e-3).log10();
        let high_shelf_db = 20.0 * config.highfreq_gain.max(1e-3).log10();
        self.iir_eq
            .set_gains(&config.eq_gains_db, low_shelf_db, high_shelf_db);
        self.fft_eq
            .set_response(&config.eq_gains_db, config.lowfreq_gain, config.highfreq_gain);
        self.fir_eq
            .set_response(&config.eq_gains_db, config.lowfreq_gain, config.highfreq_gain);

        self.compressor.set_enabled(config.use_compression);
        self.compressor.set_params(
            config.compressor_threshold,
            config.compressor_ratio,
            config.compressor_makeup,
        );

        self.stereo.set_enabled(config.use_stereo);
        self.stereo.set_width(config.stereo_width);
    }

    /// Process an interleaved stereo (or mono) buffer, shape-preserving.
    pub fn process(&mut self, buffer: &mut [f32]) {
        match self.mode {
            SpectralMode::Iir => self.iir_eq.process(buffer),
            SpectralMode::Fft => self.fft_eq.process(buffer),
            SpectralMode::Fir => self.fir_eq.process(buffer),
        }
        self.compressor.process(buffer);
        if self.channels == 2 {
            self.stereo.process_stereo(buffer);
        } else {
            self.stereo.process(buffer);
        }
    }

    /// Reset all stage state (filter delays, FFT overlap tails, FIR tails).
    /// Callers invoke this explicitly; it is never implied by a parameter
    /// change alone.
    pub fn reset(&mut self) {
        self.iir_eq.reset();
        self.fft_eq.reset();
        self.fir_eq.reset();
        self.compressor.reset();
        self.stereo.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_bitwise_identity() {
        let mut graph = DspGraph::new(48000, 2);
        graph.apply_config(&DspConfig::default());

        let mut buffer: Vec<f32> = (0..48_000 * 2)
            .map(|i| ((i as f32 * 0.0173).sin()) * 0.5 - 0.25)
            .collect();
        let original = buffer.clone();
        graph.process(&mut buffer);

        assert_eq!(buffer, original);
    }

    #[test]
    fn compressor_stage_matches_spec_scenario() {
        let mut graph = DspGraph::new(48000, 2);
        let mut config = DspConfig::default();
        config.use_compression = true;
        config.compressor_threshold = 0.3;
        config.compressor_ratio = 4.0;
        config.compressor_makeup = 1.0;
        graph.apply_config(&config);

        let mut buffer = vec![0.6, 0.6];
        graph.process(&mut buffer);
        assert!((buffer[0] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn mode_switch_uses_exclusive_processor() {
        let mut graph = DspGraph::new(48000, 2);
        let mut config = DspConfig::default();
        config.eq_enabled = true;
        config.eq_gains_db[5] = 6.0;
        config.spectral_mode = SpectralMode::Iir;
        graph.apply_config(&config);
        assert!(graph.iir_eq.is_enabled());
        assert!(!graph.fft_eq.is_enabled());

        config.spectral_mode = SpectralMode::Fft;
        graph.apply_config(&config);
        assert!(!graph.iir_eq.is_enabled());
        assert!(graph.fft_eq.is_enabled());
    }

    #[test]
    fn mono_buffer_untouched_by_stereo_widener() {
        let mut graph = DspGraph::new(48000, 1);
        let mut config = DspConfig::default();
        config.use_stereo = true;
        config.stereo_width = 2.0;
        graph.apply_config(&config);

        let mut buffer = vec![0.3, -0.6, 0.1, 0.9];
        let original = buffer.clone();
        graph.process(&mut buffer);

        assert_eq!(buffer, original);
    }

    #[test]
    fn reset_clears_state_but_config_unaffected() {
        let mut graph = DspGraph::new(48000, 2);
        let mut config = DspConfig::default();
        config.eq_enabled = true;
        config.eq_gains_db[5] = 6.0;
        graph.apply_config(&config);

        let mut buffer = vec![0.1; 100];
        graph.process(&mut buffer);
        graph.reset();

        assert!(graph.iir_eq.is_enabled());
    }
}
