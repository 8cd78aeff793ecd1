use tracing::{error, info};

/// Outcome sink for a finished pull. The engine only reports; presentation
/// (desktop notifications, badges) lives with the implementor.
pub trait Notifier: Send + Sync {
    fn notify(&self, ok: bool, message: &str);
}

/// Default notifier: writes the outcome to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, ok: bool, message: &str) {
        if ok {
            info!("✅ Sync complete: {}", message);
        } else {
            error!("❌ Sync failed: {}", message);
        }
    }
}
