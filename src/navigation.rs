use tracing::{info, warn};

/// Moves the user to an externally hosted page (checkout, billing portal).
pub trait Navigator: Send + Sync {
    fn redirect(&self, url: &str) -> anyhow::Result<()>;
}

/// Opens URLs in the default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserNavigator;

impl Navigator for BrowserNavigator {
    fn redirect(&self, url: &str) -> anyhow::Result<()> {
        info!("Opening {}", url);
        webbrowser::open(url).map_err(|e| {
            warn!("Failed to open browser: {}", e);
            anyhow::anyhow!("Failed to open browser: {}", e)
        })
    }
}

/// Terminal state of a redirecting action: the user has been sent to `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub url: String,
}
