use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

/// Counts Ctrl+C presses: the first asks to stop watching gracefully, any
/// further press asks to exit immediately.
#[derive(Debug, Default)]
pub struct ShutdownController {
    presses: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self) -> ShutdownEvent {
        let n = self.presses.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if n == 1 {
            ShutdownEvent::Graceful
        } else {
            ShutdownEvent::Immediate
        }
    }
}

pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let event = shutdown.press();
            let _ = shutdown_tx.send(event);
            if event == ShutdownEvent::Immediate {
                return;
            }
        }
    });
}
