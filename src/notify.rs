use notify_rust::{Notification, Timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing, non-blocking message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, title, message)
    }
}

/// Sink for user-visible notifications.
///
/// Implementations must never panic or fail outward: a failed notification is
/// logged and dropped.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info | NoticeLevel::Success => {
                info!("{}: {}", notice.title, notice.message)
            }
            NoticeLevel::Warning => warn!("{}: {}", notice.title, notice.message),
            NoticeLevel::Error => error!("{}: {}", notice.title, notice.message),
        }
    }
}

/// Shows notices as desktop notifications.
pub struct DesktopNotifier {
    enabled: bool,
    app_name: String,
}

impl DesktopNotifier {
    pub fn new() -> Self {
        Self {
            enabled: true,
            app_name: "Promptlib".to_string(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        debug!("Notifications {}", if enabled { "enabled" } else { "disabled" });
    }

    fn icon_and_timeout(level: NoticeLevel) -> (&'static str, u32) {
        match level {
            NoticeLevel::Info => ("dialog-information", 5000),
            NoticeLevel::Success => ("dialog-positive", 5000),
            NoticeLevel::Warning => ("dialog-warning", 7000),
            NoticeLevel::Error => ("dialog-error", 10000),
        }
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, notice: Notice) {
        if !self.enabled {
            return;
        }

        let (icon, timeout) = Self::icon_and_timeout(notice.level);
        if let Err(e) = Notification::new()
            .summary(&notice.title)
            .body(&notice.message)
            .appname(&self.app_name)
            .icon(icon)
            .timeout(Timeout::Milliseconds(timeout))
            .show()
        {
            warn!("Failed to show notification: {}", e);
            LogNotifier.notify(notice);
        } else {
            debug!("Showed notification: {} - {}", notice.title, notice.message);
        }
    }
}
