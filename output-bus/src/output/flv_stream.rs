use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    avc,
    error::OutputError,
    flv::{FlvMuxer, FlvWriter, StreamHeaders, mux::FlvMetadata},
    output::{OutputDriver, SessionInfo, flv_file::session_layout},
    packet::{EncoderPacket, EncoderType},
    settings::{Property, PropertyKind, Settings},
    sink::StreamSink,
    transport::{ConnectTarget, Connector},
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends the session as a live FLV byte stream to the service's server.
pub struct FlvStreamOutput {
    connector: Arc<dyn Connector>,
    bind_ip: String,
    target: Option<ConnectTarget>,
    layout: Option<(FlvMetadata, StreamHeaders)>,
    writer: Option<FlvWriter<StreamSink>>,
    wait_keyframe: bool,
}

impl FlvStreamOutput {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            bind_ip: String::new(),
            target: None,
            layout: None,
            writer: None,
            wait_keyframe: false,
        }
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        let (Some(target), Some((metadata, headers))) = (&self.target, &self.layout) else {
            return Err(OutputError::InvalidStream("stream is not configured".into()));
        };
        let writer = self.connector.connect(target).await?;
        self.writer = Some(FlvWriter::new(
            StreamSink::new(writer),
            FlvMuxer::new(metadata.clone()),
            headers.clone(),
        ));
        Ok(())
    }
}

#[async_trait]
impl OutputDriver for FlvStreamOutput {
    fn id(&self) -> &'static str {
        "flv_stream_output"
    }

    fn properties(&self) -> Vec<Property> {
        vec![Property::new("bind_ip", "Bind to IP", PropertyKind::Text)]
    }

    fn uses_service(&self) -> bool {
        true
    }

    fn update(&mut self, settings: &Settings) {
        self.bind_ip = settings.get_string("bind_ip");
    }

    async fn start(&mut self, session: &SessionInfo) -> Result<(), OutputError> {
        let service = session
            .service
            .as_ref()
            .ok_or_else(|| OutputError::InvalidStream("no service".into()))?;
        let url = service.url();
        if url.is_empty() {
            return Err(OutputError::BadPath("service has no server url".into()));
        }
        let bind_ip: Option<IpAddr> = ConnectTarget::parse_bind_ip(&self.bind_ip)?;

        self.layout = Some(session_layout(session, 0)?);
        self.target = Some(ConnectTarget {
            url: url.clone(),
            key: service.key(),
            bind_ip,
        });
        self.wait_keyframe = false;
        self.connect().await?;
        session.logger.info(format_args!("connected to {url}"));
        Ok(())
    }

    async fn encoded_packet(&mut self, packet: EncoderPacket) -> Result<(), OutputError> {
        if self.wait_keyframe {
            let keyframe = packet.keyframe || avc::avc_keyframe(&packet.data);
            if packet.kind != EncoderType::Video || !keyframe {
                return Ok(());
            }
            self.wait_keyframe = false;
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(OutputError::Disconnected("not connected".into()));
        };
        let result = writer.write_encoded(&packet).await;
        if result.is_err() {
            self.writer = None;
        }
        result
    }

    async fn stop(&mut self) -> Result<(), OutputError> {
        self.target = None;
        self.layout = None;
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
            Ok(res) => res,
            Err(_) => Err(OutputError::Disconnected("timed out closing the stream".into())),
        }
    }

    /// Opens a new connection; the stream restarts with fresh headers at
    /// the next video keyframe.
    async fn reconnect(&mut self, session: &SessionInfo) -> Result<(), OutputError> {
        self.writer = None;
        self.connect().await?;
        self.wait_keyframe = session.video.is_some();
        Ok(())
    }

    async fn abort(&mut self) {
        self.writer = None;
        self.target = None;
        self.layout = None;
    }
}
