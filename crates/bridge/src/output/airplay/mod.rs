mod discovery;
mod rtp;
mod rtsp;
mod sender;

pub use discovery::{discover_devices, find_device_by_name, AirPlayDevice};
pub use rtp::{get_ntp_timestamp, RtcpStream, RtpStream};
pub use rtsp::{generate_sdp, RtspClient, RtspResponse};
pub use sender::AirPlaySender;
