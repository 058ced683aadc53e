use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use crate::{
    encoder::{EncoderBackend, EncoderContext, EncoderFactory, PacketPublisher},
    error::OutputError,
    flv::mux::{FLV_HEADER_LENGTH, FLV_TAG_HEADER_LENGTH, PREVIOUS_TAG_SIZE_LENGTH},
    packet::{EncoderPacket, EncoderType},
    settings::{Property, Settings},
    sink::BoxedWriter,
    transport::{ConnectTarget, Connector},
};

/// Annex B SPS + PPS.
pub const AVC_EXTRA: &[u8] = &[
    0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x00, 0x00, 0x00, 0x01, 0x68,
    0xeb, 0xe3, 0xcb,
];

/// AAC LC, 44.1 kHz, stereo.
pub const AAC_CONFIG: &[u8] = &[0x12, 0x10];

pub const VIDEO_TIMEBASE: (i32, i32) = (1, 30);
pub const AUDIO_TIMEBASE: (i32, i32) = (1, 44100);

pub fn video_packet(index: i64, keyframe: bool) -> EncoderPacket {
    let nal_type = if keyframe { 0x65 } else { 0x41 };
    EncoderPacket::video(
        vec![0x00, 0x00, 0x00, 0x01, nal_type, index as u8, 0x88, 0x84],
        index,
        index,
        VIDEO_TIMEBASE,
        keyframe,
    )
}

pub fn audio_packet(index: i64) -> EncoderPacket {
    EncoderPacket::audio(
        vec![0x21, 0x10, 0x04, index as u8],
        index * 1024,
        AUDIO_TIMEBASE,
    )
}

/// Shared counters of a [`MockBackend`], kept after the backend moved into
/// an encoder.
#[derive(Clone, Default)]
pub struct Probe {
    initialized: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    publisher: Arc<Mutex<Option<PacketPublisher>>>,
    last_settings: Arc<Mutex<Option<Settings>>>,
}

impl Probe {
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Settings the codec was opened or last updated with.
    pub fn last_settings(&self) -> Option<Settings> {
        self.last_settings.lock().clone()
    }

    /// Publishes a packet as the running codec would. False when the codec
    /// is not running.
    pub fn send(&self, packet: EncoderPacket) -> bool {
        match self.publisher.lock().as_ref() {
            Some(publisher) => {
                publisher.send(packet);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            publisher.finish();
        }
    }
}

pub struct MockBackend {
    probe: Probe,
    extra: Option<Bytes>,
    fail_initialize: bool,
    properties: Vec<Property>,
}

impl MockBackend {
    pub fn video() -> Self {
        Self::with_extra(Some(Bytes::from_static(AVC_EXTRA)))
    }

    pub fn audio() -> Self {
        Self::with_extra(Some(Bytes::from_static(AAC_CONFIG)))
    }

    pub fn with_extra(extra: Option<Bytes>) -> Self {
        Self {
            probe: Probe::default(),
            extra,
            fail_initialize: false,
            properties: Vec::new(),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn with_properties(mut self, properties: Vec<Property>) -> Self {
        self.properties = properties;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

impl EncoderBackend for MockBackend {
    fn initialize(
        &mut self,
        ctx: &EncoderContext,
        publisher: PacketPublisher,
    ) -> anyhow::Result<()> {
        if self.fail_initialize {
            anyhow::bail!("mock codec refused to open");
        }
        self.probe.initialized.fetch_add(1, Ordering::SeqCst);
        *self.probe.last_settings.lock() = Some(ctx.settings.clone());
        *self.probe.publisher.lock() = Some(publisher);
        Ok(())
    }

    fn update(&mut self, settings: &Settings) -> anyhow::Result<()> {
        self.probe.updates.fetch_add(1, Ordering::SeqCst);
        *self.probe.last_settings.lock() = Some(settings.clone());
        Ok(())
    }

    fn extra_data(&self) -> Option<Bytes> {
        self.extra.clone()
    }

    fn properties(&self) -> Vec<Property> {
        self.properties.clone()
    }

    fn shutdown(&mut self) {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        *self.probe.publisher.lock() = None;
    }
}

/// Creates mock backends and remembers their probes by encoder name.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<(String, String)>>,
    probes: Mutex<HashMap<String, Probe>>,
    bitrates: HashMap<String, Vec<u32>>,
    properties: HashMap<String, Vec<Property>>,
    failing_init: HashSet<String>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bitrates(mut self, id: &str, bitrates: &[u32]) -> Self {
        self.bitrates.insert(id.to_string(), bitrates.to_vec());
        self
    }

    pub fn with_properties(mut self, id: &str, properties: Vec<Property>) -> Self {
        self.properties.insert(id.to_string(), properties);
        self
    }

    pub fn failing_init(mut self, id: &str) -> Self {
        self.failing_init.insert(id.to_string());
        self
    }

    /// `(id, name)` of every backend created so far.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().clone()
    }

    pub fn probe(&self, name: &str) -> Option<Probe> {
        self.probes.lock().get(name).cloned()
    }
}

impl EncoderFactory for MockFactory {
    fn create(
        &self,
        id: &str,
        name: &str,
        kind: EncoderType,
        _settings: &Settings,
    ) -> anyhow::Result<Box<dyn EncoderBackend>> {
        let mut backend = match kind {
            EncoderType::Video => MockBackend::video(),
            EncoderType::Audio => MockBackend::audio(),
        };
        if let Some(properties) = self.properties.get(id) {
            backend = backend.with_properties(properties.clone());
        }
        if self.failing_init.contains(id) {
            backend = backend.failing();
        }
        self.created.lock().push((id.to_string(), name.to_string()));
        self.probes.lock().insert(name.to_string(), backend.probe());
        Ok(Box::new(backend))
    }

    fn audio_bitrates(&self, id: &str) -> Vec<u32> {
        self.bitrates.get(id).cloned().unwrap_or_default()
    }
}

/// In-memory connection. Writes start failing once `break_connection` is
/// called.
#[derive(Clone, Default)]
pub struct MemoryWire {
    data: Arc<Mutex<Vec<u8>>>,
    broken: Arc<AtomicBool>,
}

impl MemoryWire {
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl AsyncWrite for MemoryWire {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection reset",
            )));
        }
        self.data.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connector handing out [`MemoryWire`]s. Can refuse or hang connects.
#[derive(Default)]
pub struct MockConnector {
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
    refuse: AtomicBool,
    hang: AtomicBool,
    wires: Mutex<Vec<MemoryWire>>,
    targets: Mutex<Vec<ConnectTarget>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each connect call began, oldest first.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().clone()
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connects never complete while set.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn wires(&self) -> Vec<MemoryWire> {
        self.wires.lock().clone()
    }

    pub fn last_wire(&self) -> Option<MemoryWire> {
        self.wires.lock().last().cloned()
    }

    pub fn targets(&self) -> Vec<ConnectTarget> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedWriter, OutputError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().push(Instant::now());
        self.targets.lock().push(target.clone());
        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(OutputError::ConnectFailed("connection refused".into()));
        }
        let wire = MemoryWire::default();
        self.wires.lock().push(wire.clone());
        Ok(Box::new(wire))
    }
}

/// One parsed FLV tag.
#[derive(Clone, Debug)]
pub struct FlvTag {
    pub kind: u8,
    pub ts: u32,
    pub body: Vec<u8>,
    /// Offset of the tag header in the file.
    pub offset: usize,
}

impl FlvTag {
    /// AAC or AVC sequence header.
    pub fn is_sequence_header(&self) -> bool {
        match self.kind {
            8 => self.body.get(1) == Some(&0),
            9 => self.body.get(1) == Some(&0),
            _ => false,
        }
    }
}

/// Splits an FLV byte stream into tags, checking every previous tag size.
pub fn parse_flv(data: &[u8]) -> Vec<FlvTag> {
    assert!(data.len() >= FLV_HEADER_LENGTH + PREVIOUS_TAG_SIZE_LENGTH);
    assert_eq!(&data[..3], b"FLV");
    let mut tags = Vec::new();
    let mut pos = FLV_HEADER_LENGTH + PREVIOUS_TAG_SIZE_LENGTH;
    while pos + FLV_TAG_HEADER_LENGTH <= data.len() {
        let kind = data[pos];
        let size = u32::from_be_bytes([0, data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let ts = u32::from_be_bytes([data[pos + 7], data[pos + 4], data[pos + 5], data[pos + 6]]);
        let body_start = pos + FLV_TAG_HEADER_LENGTH;
        let body = data[body_start..body_start + size].to_vec();
        let trailer = body_start + size;
        let prev = u32::from_be_bytes([
            data[trailer],
            data[trailer + 1],
            data[trailer + 2],
            data[trailer + 3],
        ]) as usize;
        assert_eq!(prev, size + FLV_TAG_HEADER_LENGTH);
        tags.push(FlvTag {
            kind,
            ts,
            body,
            offset: pos,
        });
        pos = trailer + PREVIOUS_TAG_SIZE_LENGTH;
    }
    assert_eq!(pos, data.len(), "trailing bytes after the last tag");
    tags
}

/// Finds `key` followed by an AMF number marker and returns the value.
pub fn meta_number(body: &[u8], key: &str) -> Option<f64> {
    let value = find_key(body, key)?;
    if body.get(value) != Some(&0x00) {
        return None;
    }
    read_f64(body, value + 1)
}

/// Reads the strict array stored under `key`.
pub fn meta_array(body: &[u8], key: &str) -> Option<Vec<f64>> {
    let value = find_key(body, key)?;
    if body.get(value) != Some(&0x0a) {
        return None;
    }
    let count = u32::from_be_bytes(body.get(value + 1..value + 5)?.try_into().ok()?) as usize;
    let mut out = Vec::with_capacity(count);
    let mut pos = value + 5;
    for _ in 0..count {
        if body.get(pos) != Some(&0x00) {
            return None;
        }
        out.push(read_f64(body, pos + 1)?);
        pos += 9;
    }
    Some(out)
}

fn find_key(body: &[u8], key: &str) -> Option<usize> {
    let mut needle = (key.len() as u16).to_be_bytes().to_vec();
    needle.extend_from_slice(key.as_bytes());
    body.windows(needle.len())
        .position(|w| w == needle.as_slice())
        .map(|p| p + needle.len())
}

fn read_f64(body: &[u8], pos: usize) -> Option<f64> {
    Some(f64::from_be_bytes(body.get(pos..pos + 8)?.try_into().ok()?))
}
