use std::sync::{Arc, OnceLock};

use output_bus::{
    config::ConfigMap,
    event::HandlerEvent,
    handler::{AdvancedOutput, OutputHandler, SimpleOutput},
    service::{Service, ServiceRegistry},
    settings::Settings,
    transport::TcpConnector,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::replay::ReplayFactory;

static OUTPUT_MANAGER: OnceLock<OutputManager> = OnceLock::new();

/// The process-wide output handler and the service it streams to.
pub(crate) struct OutputManager {
    // keeps the service registered
    _registry: ServiceRegistry,
    service: Service,
    handler: Box<dyn OutputHandler>,
}

impl OutputManager {
    fn new(config: ConfigMap) -> anyhow::Result<Self> {
        let registry = ServiceRegistry::new();
        let service = registry.create(
            "rtmp_custom",
            "default_service",
            Settings::new()
                .with("server", config.get_str("Stream", "Server"))
                .with("key", config.get_str("Stream", "Key")),
        );

        let factory = Arc::new(ReplayFactory::from_config(&config));
        let connector = Arc::new(TcpConnector::new());
        let mode = config.get_str("Output", "Mode");
        let handler: Box<dyn OutputHandler> = if mode == "Advanced" {
            Box::new(AdvancedOutput::new(config, factory, connector)?)
        } else {
            Box::new(SimpleOutput::new(config, factory, connector)?)
        };
        log::info!("output mode: {}", if mode == "Advanced" { "advanced" } else { "simple" });

        Ok(Self {
            _registry: registry,
            service,
            handler,
        })
    }

    pub(crate) fn handler(&self) -> &dyn OutputHandler {
        self.handler.as_ref()
    }

    pub(crate) fn service(&self) -> &Service {
        &self.service
    }
}

pub(crate) fn init_output_manager(config: ConfigMap) -> anyhow::Result<()> {
    let manager = OutputManager::new(config)?;
    if OUTPUT_MANAGER.set(manager).is_err() {
        anyhow::bail!("output manager already initialized");
    }
    Ok(())
}

pub(crate) fn get_output_manager() -> anyhow::Result<&'static OutputManager> {
    OUTPUT_MANAGER
        .get()
        .ok_or_else(|| anyhow::anyhow!("output manager not initialized"))
}

pub(crate) fn start_event_logger(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut rx = get_output_manager()?.handler().subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(HandlerEvent { kind, event }) => log::info!("{}: {:?}", kind, event),
                Err(RecvError::Lagged(n)) => log::warn!("missed {} output events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
    Ok(())
}

/// Stops both sessions; recordings are finalized before returning.
pub(crate) async fn shutdown() {
    let Ok(manager) = get_output_manager() else {
        return;
    };
    let handler = manager.handler();
    if handler.streaming_active() {
        handler.stop_streaming().await;
    }
    if handler.recording_active() {
        handler.stop_recording().await;
    }
}
