use crate::api::LLMApiProvider;
use crate::config;
use crate::models::Settings;
use crate::router::ViewRouter;
use crate::session::ChatSessionManager;
use crate::storage::StorageManager;
use std::sync::Arc;
use tokio::sync::Mutex;

// Everything a command needs, built once at startup and handed to each command
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Mutex<StorageManager>>,
    pub api_provider: Arc<dyn LLMApiProvider>,
    // In-memory copy of the persisted settings; refreshed on every save
    pub settings: Arc<Mutex<Settings>>,
    pub router: Arc<Mutex<ViewRouter>>,
    pub chat: Arc<ChatSessionManager>,
}

impl AppState {
    pub fn new(storage_manager: StorageManager, api_provider: Arc<dyn LLMApiProvider>) -> Self {
        let storage = Arc::new(Mutex::new(storage_manager));
        let chat = ChatSessionManager::new(storage.clone(), api_provider.clone());
        Self {
            storage,
            api_provider,
            settings: Arc::new(Mutex::new(config::default_settings())),
            router: Arc::new(Mutex::new(ViewRouter::default())),
            chat: Arc::new(chat),
        }
    }

    pub async fn settings_snapshot(&self) -> Settings {
        self.settings.lock().await.clone()
    }
}
