/// Real-time DSP audio processing module.
///
/// The per-device enhancer chain: EQ+Tone (IIR, FFT or FIR mode) ->
/// Compressor -> Stereo Widener. `graph` wires the three stages behind a
/// single `DspConfig`-driven interface; the other modules are the
/// individual stage implementations.
pub mod compressor;
pub mod eq;
pub mod graph;
pub mod spectral;
pub mod stereo_width;

pub use compressor::Compressor;
pub use eq::{BiquadFilter, EqProcessor};
pub use graph::DspGraph;
pub use spectral::{FftSpectralEq, FirSpectralEq};
pub use stereo_width::StereoWidth;
