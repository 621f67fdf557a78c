use std::sync::Arc;

use crate::config::Settings;
use crate::fanout::Broadcaster;
use crate::relay::NotificationSource;
use crate::session::SessionRegistry;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    /// Start the relay pipeline against `source` and wrap it for handlers
    pub fn new(settings: Settings, source: Arc<dyn NotificationSource>) -> Self {
        let supervisor = Arc::new(Supervisor::start(&settings, source));

        Self {
            settings: Arc::new(settings),
            supervisor,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.supervisor.registry()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        self.supervisor.broadcaster()
    }
}
