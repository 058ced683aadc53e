use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::settings::Settings;

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    services: Mutex<HashMap<u64, Weak<ServiceInner>>>,
}

/// Owns the id table that weak service handles resolve through.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, type_id: &str, name: &str, settings: Settings) -> Service {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let service = Service {
            inner: Arc::new(ServiceInner {
                id,
                type_id: type_id.to_string(),
                name: name.to_string(),
                settings: RwLock::new(settings),
                output: Mutex::new(None),
                registry: Arc::downgrade(&self.inner),
            }),
        };
        self.inner
            .services
            .lock()
            .insert(id, Arc::downgrade(&service.inner));
        service
    }

    pub fn get_by_name(&self, name: &str) -> Option<Service> {
        // upgrade outside the lock: dropping a last strong ref re-enters it
        let entries: Vec<_> = self.inner.services.lock().values().cloned().collect();
        entries
            .iter()
            .filter_map(Weak::upgrade)
            .find(|s| s.name == name)
            .map(|inner| Service { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ServiceInner {
    id: u64,
    type_id: String,
    name: String,
    settings: RwLock<Settings>,
    output: Mutex<Option<String>>,
    registry: Weak<RegistryInner>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.services.lock().remove(&self.id);
        }
    }
}

/// Streaming destination: server URL, stream key and encoder limits.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn type_id(&self) -> &str {
        &self.inner.type_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> String {
        self.inner.settings.read().get_string("server")
    }

    pub fn key(&self) -> String {
        self.inner.settings.read().get_string("key")
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    pub fn update(&self, settings: Settings) {
        *self.inner.settings.write() = settings;
    }

    /// Caps encoder settings to what the service accepts.
    pub fn apply_encoder_settings(
        &self,
        video: Option<&mut Settings>,
        audio: Option<&mut Settings>,
    ) {
        let settings = self.inner.settings.read();
        if let Some(video) = video {
            cap_bitrate(video, settings.get_int("max_video_bitrate"));
            if let Some(keyint) = settings.get_int("keyint_sec").filter(|k| *k > 0) {
                video.set("keyint_sec", keyint);
            }
        }
        if let Some(audio) = audio {
            cap_bitrate(audio, settings.get_int("max_audio_bitrate"));
        }
    }

    /// Records the output currently streaming to this service.
    pub fn activate(&self, output: &str) {
        *self.inner.output.lock() = Some(output.to_string());
    }

    pub fn deactivate(&self) {
        *self.inner.output.lock() = None;
    }

    pub fn active_output(&self) -> Option<String> {
        self.inner.output.lock().clone()
    }

    pub fn downgrade(&self) -> WeakService {
        WeakService {
            id: self.inner.id,
            registry: self.inner.registry.clone(),
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("type_id", &self.inner.type_id)
            .field("name", &self.inner.name)
            .finish()
    }
}

fn cap_bitrate(settings: &mut Settings, max: Option<i64>) {
    let Some(max) = max.filter(|m| *m > 0) else {
        return;
    };
    match settings.get_int("bitrate") {
        Some(bitrate) if bitrate <= max => {}
        _ => {
            settings.set("bitrate", max);
        }
    }
}

/// Non-owning service reference. Resolves through the registry, so it
/// stops resolving as soon as the last strong handle is dropped.
#[derive(Clone, Debug)]
pub struct WeakService {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl WeakService {
    pub fn upgrade(&self) -> Option<Service> {
        let registry = self.registry.upgrade()?;
        let entry = registry.services.lock().get(&self.id)?.clone();
        entry.upgrade().map(|inner| Service { inner })
    }

    pub fn references(&self, service: &Service) -> bool {
        self.id == service.inner.id && Weak::ptr_eq(&self.registry, &service.inner.registry)
    }
}
