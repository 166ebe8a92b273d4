// ===============================
// src/notifier.rs
// ===============================
//
// Satu NotificationService dipakai bersama oleh semua session (Arc),
// di-inject saat konstruksi. Notifier default: log via tracing.
//
use std::fmt::Display;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!(target: "notify", "{message}");
    }
}

#[derive(Default)]
pub struct NotificationService {
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
}

impl NotificationService {
    pub fn new() -> Self { Self::default() }

    pub fn with_log() -> Arc<Self> {
        let svc = Self::new();
        svc.add_notifier(Arc::new(LogNotifier));
        Arc::new(svc)
    }

    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers.write().push(notifier);
    }

    pub fn notify(&self, message: impl Display) {
        let message = message.to_string();
        let notifiers = self.notifiers.read().clone();
        for n in notifiers {
            n.notify(&message);
        }
    }
}
