use thiserror::Error;

/// A UPnP `UPnPError` fault, returned as the body of a SOAP fault response.
///
/// The error codes are the subset of the UPnP AVTransport/RenderingControl
/// tables this bridge actually produces; see the component design notes for
/// which action raises which code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapFault {
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("transition not available")]
    TransitionNotAvailable,
    #[error("seek mode not supported")]
    SeekNotSupported,
    #[error("illegal seek target")]
    InvalidSeekTarget,
    #[error("unknown subscription identifier")]
    PreconditionFailed,
}

impl SoapFault {
    pub fn code(self) -> u16 {
        match self {
            SoapFault::InvalidArgs => 402,
            SoapFault::TransitionNotAvailable => 701,
            SoapFault::SeekNotSupported => 712,
            SoapFault::InvalidSeekTarget => 714,
            SoapFault::PreconditionFailed => 412,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            SoapFault::InvalidArgs => "Invalid Args",
            SoapFault::TransitionNotAvailable => "Transition not available",
            SoapFault::SeekNotSupported => "Seek mode not supported",
            SoapFault::InvalidSeekTarget => "Illegal seek target",
            SoapFault::PreconditionFailed => "Precondition Failed",
        }
    }
}

/// Failure modes for the Downloader (external `ffmpeg -c:a copy` collaborator).
#[derive(Error, Debug)]
pub enum DownloaderError {
    #[error("transport error fetching {url}: {source}")]
    Transport { url: String, source: anyhow::Error },
    #[error("source codec error: {0}")]
    Source(String),
    #[error("downloader already stopped")]
    NotRunning,
}

/// Failure modes for the Decoder (external `ffmpeg` PCM-pipe collaborator).
#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("failed to spawn decoder process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("decoder process exited before producing audio")]
    PrematureExit,
}

/// Errors raised while parsing protocol-level input (DIDL-Lite, SOAP bodies,
/// GENA headers). Always client-protocol errors in the §7 taxonomy — never
/// fatal to the process.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("malformed time value: {0}")]
    BadTime(String),
}
