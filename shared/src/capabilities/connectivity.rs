use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Shared online/offline signal fed by the host shell.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns true only on an offline -> online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let mut came_back = false;
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            came_back = online;
            *current = online;
            true
        });
        if came_back {
            info!("connectivity restored");
        }
        came_back
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
