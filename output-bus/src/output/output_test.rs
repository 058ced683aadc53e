use std::{path::Path, sync::Arc, time::Duration};

use tokio::sync::broadcast;

use super::*;
use crate::{
    encoder::{AudioInfo, VideoFormat, VideoInfo},
    event::StopCode,
    flv::mux::{TAG_AUDIO, TAG_SCRIPT, TAG_VIDEO},
    service::ServiceRegistry,
    test_util::{
        MockBackend, MockConnector, Probe, audio_packet, parse_flv, video_packet,
    },
};

struct Encoders {
    video: Encoder,
    video_probe: Probe,
    audio: Encoder,
    audio_probe: Probe,
}

fn encoders() -> Encoders {
    let backend = MockBackend::video();
    let video_probe = backend.probe();
    let video = Encoder::new(
        "obs_x264",
        "h264",
        EncoderType::Video,
        0,
        Settings::new().with("bitrate", 2500),
        Box::new(backend),
    );
    video.set_video(VideoInfo {
        width: 1280,
        height: 720,
        fps_num: 30,
        fps_den: 1,
        format: VideoFormat::Nv12,
    });

    let backend = MockBackend::audio();
    let audio_probe = backend.probe();
    let audio = Encoder::new(
        "ffmpeg_aac",
        "aac",
        EncoderType::Audio,
        0,
        Settings::new().with("bitrate", 160),
        Box::new(backend),
    );
    audio.set_audio(AudioInfo {
        sample_rate: 44100,
        channels: 2,
    });

    Encoders {
        video,
        video_probe,
        audio,
        audio_probe,
    }
}

fn file_output(path: &Path, enc: &Encoders) -> Output {
    let output = Output::new("rec", FlvFileOutput::new());
    output.update(Settings::new().with("path", path.to_string_lossy().to_string()));
    output.set_video_encoder(Some(enc.video.clone())).unwrap();
    output.set_audio_encoder(Some(enc.audio.clone()), 0).unwrap();
    output
}

fn stream_output(connector: Arc<MockConnector>, service: &Service, enc: &Encoders) -> Output {
    let output = Output::new("stream", FlvStreamOutput::new(connector));
    output.set_service(service);
    output.set_video_encoder(Some(enc.video.clone())).unwrap();
    output.set_audio_encoder(Some(enc.audio.clone()), 0).unwrap();
    output
}

fn service(registry: &ServiceRegistry) -> Service {
    registry.create(
        "rtmp_custom",
        "ingest",
        Settings::new()
            .with("server", "tcp://ingest.local:1935")
            .with("key", "live_123"),
    )
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    done: impl Fn(&SessionEvent) -> bool,
) -> anyhow::Result<Vec<SessionEvent>> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await??;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return Ok(seen);
        }
    }
}

fn is_stopped(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::SessionStopped { .. })
}

#[tokio::test]
async fn test_idle_stop_and_force_stop_do_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let enc = encoders();
    let output = file_output(&dir.path().join("idle.flv"), &enc);
    let mut events = output.subscribe();

    output.stop().await;
    output.force_stop().await;

    assert_eq!(output.state(), SessionState::Idle);
    assert!(events.try_recv().is_err());
    assert_eq!(enc.video_probe.initialized(), 0);
    assert!(!dir.path().join("idle.flv").exists());
    Ok(())
}

#[tokio::test]
async fn test_start_while_active_is_noop() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("twice.flv");
    let enc = encoders();
    let output = file_output(&path, &enc);
    let mut events = output.subscribe();

    output.start().await?;
    output.start().await?;
    assert!(output.active());
    assert_eq!(enc.video_probe.initialized(), 1);
    assert!(enc.video.active());

    enc.video_probe.send(video_packet(0, true));
    output.stop().await;

    let seen = wait_for(&mut events, is_stopped).await?;
    assert_eq!(seen.first(), Some(&SessionEvent::SessionStarted));
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::SessionStopped {
            code: StopCode::Success
        })
    );
    assert_eq!(output.state(), SessionState::Idle);
    assert!(!enc.video.active());
    assert_eq!(enc.video_probe.shutdowns(), 1);

    let tags = parse_flv(&std::fs::read(&path)?);
    assert_eq!(tags.iter().filter(|t| t.kind == TAG_SCRIPT).count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_packets_from_many_threads_get_one_header_block() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("threads.flv");
    let enc = encoders();
    let output = file_output(&path, &enc);
    output.start().await?;

    // the recording opens at the first keyframe
    enc.video_probe.send(video_packet(0, true));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let video = enc.video_probe.clone();
    let audio = enc.audio_probe.clone();
    let threads = [
        std::thread::spawn(move || {
            for i in 1..30 {
                video.send(video_packet(i, i % 10 == 0));
            }
        }),
        std::thread::spawn(move || {
            for i in 0..30 {
                audio.send(audio_packet(i));
            }
        }),
    ];
    for thread in threads {
        thread.join().expect("sender thread panicked");
    }
    output.stop().await;

    let tags = parse_flv(&std::fs::read(&path)?);
    assert_eq!(tags.iter().filter(|t| t.kind == TAG_SCRIPT).count(), 1);
    assert_eq!(tags.iter().filter(|t| t.is_sequence_header()).count(), 2);
    assert!(tags[1..3].iter().all(|t| t.is_sequence_header()));
    let data = tags.iter().filter(|t| !t.is_sequence_header() && t.kind != TAG_SCRIPT);
    assert_eq!(data.count(), 60);

    for kind in [TAG_AUDIO, TAG_VIDEO] {
        let ts: Vec<u32> = tags
            .iter()
            .filter(|t| t.kind == kind && !t.is_sequence_header())
            .map(|t| t.ts)
            .collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }
    Ok(())
}

#[tokio::test]
async fn test_recording_joining_shared_encoder_opens_on_keyframe() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let enc = encoders();
    let first = file_output(&dir.path().join("first.flv"), &enc);
    first.start().await?;
    enc.video_probe.send(video_packet(0, true));
    enc.video_probe.send(video_packet(1, false));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let path = dir.path().join("joined.flv");
    let joined = file_output(&path, &enc);
    joined.start().await?;
    assert_eq!(enc.video_probe.initialized(), 1);
    enc.video_probe.send(video_packet(2, false));
    enc.audio_probe.send(audio_packet(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    enc.video_probe.send(video_packet(3, true));
    tokio::time::sleep(Duration::from_millis(50)).await;
    enc.audio_probe.send(audio_packet(4));
    joined.stop().await;
    first.stop().await;

    let tags = parse_flv(&std::fs::read(&path)?);
    let data: Vec<_> = tags
        .iter()
        .filter(|t| t.kind != TAG_SCRIPT && !t.is_sequence_header())
        .collect();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].kind, TAG_VIDEO);
    assert_eq!(data[0].body[0] >> 4, 1);
    assert_eq!(data[0].ts, 0);
    assert_eq!(data[1].kind, TAG_AUDIO);
    Ok(())
}

#[tokio::test]
async fn test_encoder_change_refused_while_active() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let enc = encoders();
    let output = file_output(&dir.path().join("busy.flv"), &enc);
    output.start().await?;

    let other = encoders();
    assert!(matches!(
        output.set_video_encoder(Some(other.video)),
        Err(OutputError::Busy(_))
    ));
    assert!(matches!(
        output.set_audio_encoder(Some(enc.audio.clone()), MAX_AUDIO_MIXES),
        Err(OutputError::InvalidStream(_))
    ));
    output.stop().await;
    assert!(output.set_video_encoder(None).is_ok());
    Ok(())
}

#[tokio::test]
async fn test_encoder_failure_detaches_everything() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fail.flv");
    let enc = encoders();
    let broken = Encoder::new(
        "ffmpeg_aac",
        "broken_aac",
        EncoderType::Audio,
        1,
        Settings::new(),
        Box::new(MockBackend::audio().failing()),
    );
    let output = file_output(&path, &enc);
    output.set_audio_encoder(Some(broken), 1)?;

    let err = output.start().await.unwrap_err();
    assert!(matches!(err, OutputError::Encoder(_)));
    assert_eq!(output.state(), SessionState::Idle);
    assert_eq!(enc.video_probe.initialized(), 1);
    assert_eq!(enc.video_probe.shutdowns(), 1);
    assert!(!enc.video.active() && !enc.audio.active());
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_directory_is_bad_path() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let enc = encoders();
    let output = file_output(&dir.path().join("missing").join("x.flv"), &enc);

    let err = output.start().await.unwrap_err();
    assert_eq!(err.code(), StopCode::BadPath);
    assert!(!enc.video.active());
    Ok(())
}

#[tokio::test]
async fn test_force_stop_cancels_configuring() -> anyhow::Result<()> {
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    connector.hang(true);
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);

    let starting = tokio::spawn({
        let output = output.clone();
        async move { output.start().await }
    });
    while connector.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(output.state(), SessionState::Configuring);

    output.force_stop().await;
    let result = starting.await?;
    assert!(matches!(result, Err(OutputError::Canceled)));
    assert_eq!(output.state(), SessionState::Idle);
    assert!(!enc.video.active() && !enc.audio.active());
    assert_eq!(enc.video_probe.shutdowns(), 1);
    assert_eq!(svc.active_output(), None);
    Ok(())
}

#[tokio::test]
async fn test_stream_needs_live_service() -> anyhow::Result<()> {
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);
    drop(svc);

    assert!(matches!(
        output.start().await,
        Err(OutputError::InvalidStream(_))
    ));
    assert_eq!(connector.attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_retries() -> anyhow::Result<()> {
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);
    output.set_reconnect_settings(ReconnectPolicy {
        enabled: true,
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
    });
    let mut events = output.subscribe();

    output.start().await?;
    assert_eq!(svc.active_output().as_deref(), Some("stream"));
    assert_eq!(connector.targets()[0].key, "live_123");

    connector.refuse(true);
    connector.last_wire().unwrap().break_connection();
    enc.video_probe.send(video_packet(0, true));

    let seen = wait_for(&mut events, is_stopped).await?;
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(connector.attempts(), 4);
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::SessionStopped {
            code: StopCode::Disconnected
        })
    );
    assert_eq!(svc.active_output(), None);
    assert!(!enc.video.active());
    Ok(())
}

#[tokio::test]
async fn test_reconnect_attempts_are_spaced_by_retry_delay() -> anyhow::Result<()> {
    let retry_delay = Duration::from_millis(80);
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);
    output.set_reconnect_settings(ReconnectPolicy {
        enabled: true,
        max_retries: 3,
        retry_delay,
    });
    let mut events = output.subscribe();

    output.start().await?;
    connector.refuse(true);
    connector.last_wire().unwrap().break_connection();
    let broken_at = std::time::Instant::now();
    enc.video_probe.send(video_packet(0, true));

    let seen = wait_for(&mut events, is_stopped).await?;
    let stopped_at = std::time::Instant::now();
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::SessionStopped {
            code: StopCode::Disconnected
        })
    );

    // the initial connect, then one attempt per retry
    let times = connector.attempt_times();
    assert_eq!(times.len(), 4);
    assert!(times[1] >= broken_at + retry_delay);
    for pair in times[1..].windows(2) {
        assert!(pair[1] - pair[0] >= retry_delay);
    }
    assert!(stopped_at - broken_at >= retry_delay * 3);
    Ok(())
}

#[tokio::test]
async fn test_disabled_reconnect_fails_at_once() -> anyhow::Result<()> {
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);
    output.set_reconnect_settings(ReconnectPolicy::disabled());
    let mut events = output.subscribe();

    output.start().await?;
    connector.last_wire().unwrap().break_connection();
    enc.audio_probe.send(audio_packet(0));

    let seen = wait_for(&mut events, is_stopped).await?;
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, SessionEvent::Reconnecting { .. }))
    );
    assert_eq!(connector.attempts(), 1);
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::SessionStopped {
            code: StopCode::Disconnected
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_reconnect_restarts_stream_at_keyframe() -> anyhow::Result<()> {
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);
    output.set_reconnect_settings(ReconnectPolicy {
        enabled: true,
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
    });
    let mut events = output.subscribe();

    output.start().await?;
    connector.last_wire().unwrap().break_connection();
    enc.video_probe.send(video_packet(0, true));
    wait_for(&mut events, |e| *e == SessionEvent::Reconnected).await?;

    enc.audio_probe.send(audio_packet(1));
    enc.video_probe.send(video_packet(1, false));
    enc.video_probe.send(video_packet(2, true));
    output.stop().await;

    let wires = connector.wires();
    assert_eq!(wires.len(), 2);
    let tags = parse_flv(&wires[1].data());
    let kinds: Vec<u8> = tags.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TAG_SCRIPT, TAG_AUDIO, TAG_VIDEO, TAG_VIDEO]);
    assert_eq!(tags[3].body[0], 0x17);
    Ok(())
}

#[tokio::test]
async fn test_delay_withholds_packets() -> anyhow::Result<()> {
    let registry = ServiceRegistry::new();
    let svc = service(&registry);
    let connector = Arc::new(MockConnector::new());
    let enc = encoders();
    let output = stream_output(connector.clone(), &svc, &enc);
    output.set_delay(Duration::from_millis(150), true);
    let mut events = output.subscribe();

    output.start().await?;
    assert_eq!(output.state(), SessionState::DelayBuffering);
    assert_eq!(output.active_delay(), Duration::from_millis(150));
    assert_eq!(
        events.recv().await?,
        SessionEvent::DelayStarting {
            delay: Duration::from_millis(150)
        }
    );

    enc.video_probe.send(video_packet(0, true));
    tokio::time::sleep(Duration::from_millis(30)).await;
    let wire = connector.last_wire().unwrap();
    assert!(wire.data().is_empty());

    wait_for(&mut events, |e| *e == SessionEvent::SessionStarted).await?;
    assert_eq!(output.state(), SessionState::Active);

    // graceful stop flushes what is still buffered
    enc.video_probe.send(video_packet(1, false));
    output.stop().await;
    let seen = wait_for(&mut events, is_stopped).await?;
    assert!(
        seen.iter()
            .any(|e| matches!(e, SessionEvent::DelayStopping { .. }))
    );
    let tags = parse_flv(&wire.data());
    let video: Vec<_> = tags
        .iter()
        .filter(|t| t.kind == TAG_VIDEO && !t.is_sequence_header())
        .collect();
    assert_eq!(video.len(), 2);
    assert_eq!(output.active_delay(), Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn test_encoder_eof_ends_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let enc = encoders();
    let output = file_output(&dir.path().join("eof.flv"), &enc);
    let mut events = output.subscribe();
    output.start().await?;

    enc.video_probe.send(video_packet(0, true));
    enc.video_probe.finish();
    enc.audio_probe.finish();

    let seen = wait_for(&mut events, is_stopped).await?;
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::SessionStopped {
            code: StopCode::Success
        })
    );
    assert_eq!(output.state(), SessionState::Idle);
    Ok(())
}
