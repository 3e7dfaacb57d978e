//! Headless Chromium hosting via the Chrome `DevTools` Protocol.
//!
//! One [`ChromiumDriver`] owns one browser process and one page. The engine
//! bundle is injected with `set_content`, and every applet call is a single
//! `Runtime.evaluate` wrapped so that exceptions come back as data.

use crate::config::EngineConfig;
use crate::driver::{
    call_script, canvas_size_script, decode_call_envelope, host_page_html, readiness_script,
    EngineDriver, EngineLauncher, Readiness,
};
use crate::result::{VizhostError, VizhostResult};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig as CdpConfig};
use chromiumoxide::page::Page as CdpPage;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Launches a fresh Chromium process per engine instance
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumLauncher;

impl ChromiumLauncher {
    /// Create a launcher
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self, config: &EngineConfig) -> VizhostResult<Box<dyn EngineDriver>> {
        Ok(Box::new(ChromiumDriver::launch(config).await?))
    }

    fn name(&self) -> &'static str {
        "chromium"
    }
}

/// Engine session hosted in a real Chromium page
#[derive(Debug)]
pub struct ChromiumDriver {
    applet_global: String,
    browser: Option<CdpBrowser>,
    page: Option<CdpPage>,
    handler: Option<JoinHandle<()>>,
}

impl ChromiumDriver {
    /// Launch Chromium, open a page, and inject the engine bundle.
    ///
    /// Any partially launched process is closed before an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `Launch` if the browser cannot start or the page cannot be created
    pub async fn launch(config: &EngineConfig) -> VizhostResult<Self> {
        let mut builder =
            CdpConfig::builder().window_size(config.viewport_width, config.viewport_height);

        if !config.headless {
            builder = builder.with_head();
        }

        if !config.sandbox {
            builder = builder.no_sandbox();
        }

        if let Some(ref path) = config.chromium_path {
            builder = builder.chrome_executable(path);
        }

        builder = builder.args(config.extra_launch_args.iter().map(String::as_str));

        let cdp_config = builder.build().map_err(VizhostError::launch)?;

        let (browser, mut handler) = CdpBrowser::launch(cdp_config)
            .await
            .map_err(|e| VizhostError::launch(e.to_string()))?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let mut driver = Self {
            applet_global: config.applet_global.clone(),
            browser: Some(browser),
            page: None,
            handler: Some(handle),
        };

        if let Err(e) = driver.open_engine_page(config).await {
            if let Err(close_err) = driver.close().await {
                warn!(error = %close_err, "failed to close partially launched browser");
            }
            return Err(e);
        }

        Ok(driver)
    }

    async fn open_engine_page(&mut self, config: &EngineConfig) -> VizhostResult<()> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| VizhostError::launch("browser already closed"))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| VizhostError::launch(format!("failed to open page: {e}")))?;

        page.set_content(host_page_html(config))
            .await
            .map_err(|e| VizhostError::launch(format!("failed to load engine bundle: {e}")))?;

        debug!(bundle = %config.bundle_url, "engine bundle injected");
        self.page = Some(page);
        Ok(())
    }

    async fn evaluate(&self, script: String) -> VizhostResult<Value> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| VizhostError::connection("page is closed"))?;

        let result = page
            .evaluate(script)
            .await
            .map_err(|e| VizhostError::connection(e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl EngineDriver for ChromiumDriver {
    async fn readiness(&self) -> VizhostResult<Readiness> {
        let value = self.evaluate(readiness_script(&self.applet_global)).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn call(&self, method: &str, args: &[Value]) -> VizhostResult<Value> {
        let envelope = self
            .evaluate(call_script(&self.applet_global, method, args)?)
            .await?;
        decode_call_envelope(envelope)
    }

    async fn canvas_size(&self) -> VizhostResult<Option<(u32, u32)>> {
        let value = self.evaluate(canvas_size_script().to_string()).await?;
        Ok(serde_json::from_value::<Option<(u32, u32)>>(value)
            .ok()
            .flatten()
            .filter(|(w, h)| *w > 0 && *h > 0))
    }

    async fn close(&mut self) -> VizhostResult<()> {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!(error = %e, "failed to close engine page");
            }
        }

        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "failed to close browser");
            }
            if let Err(e) = browser.wait().await {
                warn!(error = %e, "failed to reap browser process");
            }
        }

        if let Some(handle) = self.handler.take() {
            handle.abort();
        }

        Ok(())
    }
}

impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.handler.take() {
            handle.abort();
        }
    }
}
