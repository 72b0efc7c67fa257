use async_trait::async_trait;
use gateway::app::{AppState, build_router};
use gateway::liveness::LivenessProbe;
use gateway::registry::SessionRegistry;
use gateway::store::StoreConfig;
use gateway::store::memory::InMemoryStore;
use gateway::transport::loopback::LoopbackConnector;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

pub async fn read_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

/// Liveness probe whose answer tests can flip.
#[derive(Default)]
pub struct SwitchProbe {
    down: AtomicBool,
}

impl SwitchProbe {
    pub fn set_reachable(&self, reachable: bool) {
        self.down.store(!reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl LivenessProbe for SwitchProbe {
    async fn check_reachable(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

pub struct TestApp {
    pub router: axum::Router,
    pub connector: LoopbackConnector,
    pub store: Arc<InMemoryStore>,
    pub probe: Arc<SwitchProbe>,
    pub registry: SessionRegistry,
}

pub fn test_app() -> TestApp {
    let store = Arc::new(InMemoryStore::new(StoreConfig::default()));
    let connector = LoopbackConnector::new();
    let probe = Arc::new(SwitchProbe::default());
    let registry = SessionRegistry::new(store.clone(), Arc::new(connector.clone()));
    let state = AppState {
        registry: registry.clone(),
        store: store.clone(),
        store_config: StoreConfig::default(),
        liveness: probe.clone(),
    };
    TestApp {
        router: build_router(state),
        connector,
        store,
        probe,
        registry,
    }
}
