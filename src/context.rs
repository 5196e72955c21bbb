use std::sync::Arc;

use crate::config::ClientConfig;
use crate::gateway::RemoteGateway;
use crate::navigation::Navigator;
use crate::notify::Notifier;
use crate::sync::InvalidationBus;

/// Everything a hook needs from the outside world, passed explicitly.
#[derive(Clone)]
pub struct ClientContext {
    pub gateway: Arc<dyn RemoteGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub navigator: Arc<dyn Navigator>,
    pub bus: InvalidationBus,
    pub config: Arc<ClientConfig>,
}

impl ClientContext {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        notifier: Arc<dyn Notifier>,
        navigator: Arc<dyn Navigator>,
        config: ClientConfig,
    ) -> Self {
        Self {
            gateway,
            notifier,
            navigator,
            bus: InvalidationBus::new(),
            config: Arc::new(config),
        }
    }
}
