/// AirPlaySender — the Output variant that forwards PCM to a discovered
/// AirPlay device.
///
/// This is a thin adapter: it performs the RTSP handshake (OPTIONS,
/// ANNOUNCE, SETUP, RECORD, TEARDOWN) and frames outgoing audio as RTP,
/// but sends raw big-endian 16-bit PCM rather than ALAC-encoded audio and
/// does not negotiate AirPlay's encryption. It is not a drop-in
/// replacement for a production RAOP stack.
use super::discovery::AirPlayDevice;
use super::rtp::{RtcpStream, RtpStream, get_ntp_timestamp};
use super::rtsp::{RtspClient, generate_sdp};
use crate::convert::convert_format;
use crate::output::OutputSink;
use crate::types::{AudioBlock, OutputConfig, SampleFormat};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, info};

const SAMPLES_PER_PACKET: u32 = 352;

pub struct AirPlaySender {
    device: Option<AirPlayDevice>,
    config: Option<OutputConfig>,
    rtsp_client: Option<RtspClient>,
    rtp_stream: Option<RtpStream>,
    rtcp_stream: Option<RtcpStream>,
    is_open: bool,
    packets_sent: u32,
    bytes_sent: u32,
}

impl AirPlaySender {
    pub fn new() -> Self {
        Self {
            device: None,
            config: None,
            rtsp_client: None,
            rtp_stream: None,
            rtcp_stream: None,
            is_open: false,
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn set_device(&mut self, device: AirPlayDevice) {
        self.device = Some(device);
    }

    async fn setup_connection(&mut self, cfg: &OutputConfig) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| anyhow!("No device set"))?;

        info!(
            "Setting up AirPlay connection to {} ({}:{})",
            device.name, device.hostname, device.port
        );

        let mut rtsp = RtspClient::new();
        let ip = device
            .addresses
            .first()
            .ok_or_else(|| anyhow!("No IP address for device"))?;

        rtsp.connect(&ip.to_string(), device.port).await?;

        let uri = format!("rtsp://{}:{}", ip, device.port);
        let options_resp = rtsp.options(&uri).await?;
        debug!("OPTIONS response: {}", options_resp.status_code);

        let sdp = generate_sdp(cfg.sample_rate, cfg.channels);
        let announce_resp = rtsp.announce(&uri, &sdp).await?;
        if announce_resp.status_code != 200 {
            return Err(anyhow!("ANNOUNCE failed: {}", announce_resp.status_text));
        }

        let local_rtp_port = 6000;
        let local_rtcp_port = 6001;

        let rtp_dest = format!("{}:{}", ip, local_rtp_port).parse()?;
        let rtcp_dest = format!("{}:{}", ip, local_rtcp_port).parse()?;

        let rtp_stream = RtpStream::new(local_rtp_port, rtp_dest).await?;
        let rtcp_stream = RtcpStream::new(local_rtcp_port, rtcp_dest).await?;

        let transport = format!(
            "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port={};timing_port={}",
            local_rtcp_port, local_rtcp_port
        );

        let setup_resp = rtsp.setup(&uri, &transport).await?;
        if setup_resp.status_code != 200 {
            return Err(anyhow!("SETUP failed: {}", setup_resp.status_text));
        }

        let seq = rtp_stream.sequence_number();
        let rtptime = rtp_stream.timestamp();
        let record_resp = rtsp.record(&uri, seq, rtptime).await?;
        if record_resp.status_code != 200 {
            return Err(anyhow!("RECORD failed: {}", record_resp.status_text));
        }

        self.rtsp_client = Some(rtsp);
        self.rtp_stream = Some(rtp_stream);
        self.rtcp_stream = Some(rtcp_stream);

        info!("AirPlay connection established");
        Ok(())
    }
}

impl Default for AirPlaySender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputSink for AirPlaySender {
    fn name(&self) -> &'static str {
        "airplay"
    }

    async fn open(&mut self, cfg: OutputConfig) -> Result<()> {
        debug!("Opening AirPlay sender");

        if self.device.is_none() {
            return Err(anyhow!("No device set. Use set_device() first"));
        }

        self.setup_connection(&cfg).await?;
        self.config = Some(cfg);
        self.is_open = true;

        Ok(())
    }

    async fn write(&mut self, block: AudioBlock<'_>) -> Result<()> {
        if !self.is_open {
            return Err(anyhow!("Sink not open"));
        }

        let mut pcm_data = Vec::new();
        convert_format(block, SampleFormat::S16LE, &mut pcm_data)?;

        // RTP carries big-endian S16; convert_format produces the host's
        // native little-endian encoding (what LocalSpeaker/cpal wants), so
        // swap each sample's byte order before it goes on the wire.
        for sample in pcm_data.chunks_exact_mut(2) {
            sample.swap(0, 1);
        }

        let rtp = self
            .rtp_stream
            .as_mut()
            .ok_or_else(|| anyhow!("RTP stream not set up"))?;

        for chunk in pcm_data.chunks(SAMPLES_PER_PACKET as usize * 2 * block.channels as usize) {
            rtp.send_packet(chunk, SAMPLES_PER_PACKET).await?;
            self.packets_sent += 1;
            self.bytes_sent += chunk.len() as u32;

            if self.packets_sent % 100 == 0 {
                if let Some(rtcp) = self.rtcp_stream.as_ref() {
                    let ntp_ts = get_ntp_timestamp();
                    let rtp_ts = rtp.timestamp();
                    let ssrc = rtp.ssrc();
                    rtcp.send_sender_report(ssrc, ntp_ts, rtp_ts, self.packets_sent, self.bytes_sent)
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing AirPlay sender");

        if let (Some(rtsp), Some(device)) = (self.rtsp_client.as_mut(), &self.device) {
            let ip = device
                .addresses
                .first()
                .ok_or_else(|| anyhow!("No IP address for device"))?;
            let uri = format!("rtsp://{}:{}", ip, device.port);
            let _ = rtsp.teardown(&uri).await;
            let _ = rtsp.close().await;
        }

        self.rtsp_client = None;
        self.rtp_stream = None;
        self.rtcp_stream = None;
        self.config = None;
        self.is_open = false;

        info!("AirPlay sender closed");
        Ok(())
    }

    fn latency_ms(&self) -> u32 {
        2000
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn airplay_sender_create() {
        let sender = AirPlaySender::new();
        assert_eq!(sender.name(), "airplay");
        assert!(!sender.is_open());
    }

    #[tokio::test]
    async fn airplay_sender_requires_device() {
        let mut sender = AirPlaySender::new();
        let config = OutputConfig::default();

        let result = sender.open(config).await;
        assert!(result.is_err());
    }
}
