use chrono::Local;
use fantoccini::elements::Element;
use fantoccini::{
    Client, ClientBuilder, Locator,
    wd::{Capabilities, WindowHandle},
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::time::Duration;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("WebDriver connection failed: {0}")]
    ConnectionError(String),

    #[error("Browser operation failed: {0}")]
    OperationError(String),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Screenshot failed: {0}")]
    ScreenshotError(String),
}

/// Configuration options for initializing a browser session.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Whether the browser should run in headless mode.
    pub headless: bool,
    /// Optional window dimensions (width, height).
    pub window_size: Option<(u32, u32)>,
    /// Optional user agent string override.
    pub user_agent: Option<String>,
    /// WebDriver endpoint to connect to.
    pub webdriver_url: String,
    /// Timeout for element waits.
    pub wait_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            window_size: Some((735, 1080)),
            user_agent: None,
            webdriver_url: "http://localhost:4444".to_string(),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

impl BrowserOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets headless mode (true = no UI).
    pub fn headless(mut self, enabled: bool) -> Self {
        self.headless = enabled;
        self
    }

    /// Sets the browser window size.
    pub fn window_size(mut self, width: u32, height: u32) -> Self {
        self.window_size = Some((width, height));
        self
    }

    /// Overrides the browser's default user agent string.
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(ua.to_string());
        self
    }

    /// Sets the WebDriver endpoint.
    pub fn webdriver_url(mut self, url: &str) -> Self {
        self.webdriver_url = url.to_string();
        self
    }

    /// Sets the timeout used for bounded element waits.
    pub fn wait_timeout(mut self, seconds: u64) -> Self {
        self.wait_timeout = Duration::from_secs(seconds);
        self
    }
}

/// High-level browser automation client powered by `fantoccini`.
pub struct BrowserClient {
    pub client: Client,
    options: BrowserOptions,
    current_tab: Option<WindowHandle>,
}

impl BrowserClient {
    /// Connects to the WebDriver server with the given options.
    pub async fn connect(options: BrowserOptions) -> Result<Self, BrowserError> {
        let mut caps = Capabilities::new();

        let mut firefox_options = json!({
            "args": if options.headless {
                vec!["-headless"]
            } else {
                vec![]
            }
        });

        if let Some(ua) = &options.user_agent {
            firefox_options["prefs"] = json!({
                "general.useragent.override": ua
            });
        }

        caps.insert("moz:firefoxOptions".to_string(), firefox_options);

        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(&options.webdriver_url)
            .await
            .map_err(|e| BrowserError::ConnectionError(e.to_string()))?;

        if let Some((width, height)) = options.window_size {
            client
                .set_window_size(width, height)
                .await
                .map_err(|e| BrowserError::OperationError(e.to_string()))?;
        }

        let handles = client
            .windows()
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))?;

        let current_tab = handles.first().cloned();

        Ok(Self {
            client,
            options,
            current_tab,
        })
    }

    /// Navigates the current tab to the given URL.
    pub async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        log::debug!("navigating to {url}");
        self.client
            .goto(url)
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }

    /// Returns the current URL as a string.
    pub async fn current_url(&mut self) -> Result<String, BrowserError> {
        self.client
            .current_url()
            .await
            .map(|u| u.to_string())
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }

    /// Waits (bounded) for an element to appear and returns it.
    pub async fn wait_for(&mut self, locator: Locator<'_>) -> Result<Element, BrowserError> {
        self.client
            .wait()
            .at_most(self.options.wait_timeout)
            .for_element(locator)
            .await
            .map_err(|e| BrowserError::NotFound(format!("{locator:?}: {e}")))
    }

    /// Like [`wait_for`], but yields `None` on timeout instead of an error.
    pub async fn try_wait_for(&mut self, locator: Locator<'_>) -> Option<Element> {
        self.client
            .wait()
            .at_most(self.options.wait_timeout)
            .for_element(locator)
            .await
            .ok()
    }

    /// Finds all elements matching the locator without waiting.
    pub async fn find_all(&mut self, locator: Locator<'_>) -> Result<Vec<Element>, BrowserError> {
        self.client
            .find_all(locator)
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }

    /// Returns the first visible element among a list of fallback locators.
    /// The site's markup shifts between deployments, so callers pass the
    /// selectors in confidence order.
    pub async fn first_visible(&mut self, locators: &[Locator<'_>]) -> Option<Element> {
        for locator in locators {
            let Ok(candidates) = self.client.find_all(*locator).await else {
                continue;
            };
            for el in candidates {
                if el.is_displayed().await.unwrap_or(false) {
                    log::debug!("matched {locator:?}");
                    return Some(el);
                }
            }
        }
        None
    }

    /// Scrolls an element into view and clicks it, falling back to a
    /// JavaScript click when the WebDriver click is intercepted.
    pub async fn click(&mut self, el: &Element) -> Result<(), BrowserError> {
        let _ = self
            .client
            .execute(
                "arguments[0].scrollIntoView(true);",
                vec![serde_json::to_value(el)
                    .map_err(|e| BrowserError::OperationError(e.to_string()))?],
            )
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        if el.click().await.is_ok() {
            return Ok(());
        }

        log::debug!("native click failed, retrying via JavaScript");
        self.client
            .execute(
                "arguments[0].click();",
                vec![serde_json::to_value(el)
                    .map_err(|e| BrowserError::OperationError(e.to_string()))?],
            )
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::OperationError(format!("click failed: {e}")))
    }

    /// Waits for an element and clicks it.
    pub async fn click_locator(&mut self, locator: Locator<'_>) -> Result<(), BrowserError> {
        let el = self.wait_for(locator).await?;
        self.click(&el).await
    }

    /// Clears an input and types into it, falling back to a JavaScript value
    /// assignment with synthetic input events when send_keys is refused.
    pub async fn fill(&mut self, el: &Element, text: &str) -> Result<(), BrowserError> {
        if el.clear().await.is_ok() && el.send_keys(text).await.is_ok() {
            return Ok(());
        }

        log::debug!("send_keys failed, assigning value via JavaScript");
        let script = r#"
            const el = arguments[0];
            el.value = arguments[1];
            for (const type of ['focus', 'input', 'change', 'blur']) {
                el.dispatchEvent(new Event(type, { bubbles: true }));
            }
        "#;
        let el_value =
            serde_json::to_value(el).map_err(|e| BrowserError::OperationError(e.to_string()))?;
        self.client
            .execute(script, vec![el_value, json!(text)])
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::OperationError(format!("fill failed: {e}")))
    }

    /// Returns the trimmed text of the first element matching the locator.
    pub async fn element_text(&mut self, locator: Locator<'_>) -> Result<String, BrowserError> {
        let el = self.wait_for(locator).await?;
        el.text()
            .await
            .map(|t| t.trim().to_string())
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }

    /// Collects the text of every currently visible toast popup.
    pub async fn visible_toasts(&mut self) -> Result<Vec<String>, BrowserError> {
        let mut texts = Vec::new();
        for toast in self.find_all(Locator::Css(".van-toast")).await? {
            if !toast.is_displayed().await.unwrap_or(false) {
                continue;
            }
            if let Ok(text) = toast.text().await {
                let text = text.trim().to_string();
                if !text.is_empty() {
                    texts.push(text);
                }
            }
        }
        Ok(texts)
    }

    /// Returns the full page source HTML of the current tab.
    pub async fn source(&mut self) -> Result<String, BrowserError> {
        self.client
            .source()
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }

    /// Runs a script in the page and returns its result.
    pub async fn execute(
        &mut self,
        script: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, BrowserError> {
        self.client
            .execute(script, args)
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }

    /// Polls until every image on the page has finished loading, up to the
    /// given bound. Returns whether they all loaded.
    pub async fn wait_for_images(&mut self, max_wait: Duration) -> Result<bool, BrowserError> {
        let script =
            "return Array.from(document.images).every(img => img.complete && img.naturalWidth > 0);";
        let poll = Duration::from_millis(500);
        let mut waited = Duration::ZERO;

        while waited < max_wait {
            let loaded = self.execute(script, vec![]).await?;
            if loaded.as_bool() == Some(true) {
                return Ok(true);
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        Ok(false)
    }

    /// Captures a timestamped screenshot into `output_dir`.
    pub async fn capture_screenshot(
        &mut self,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<PathBuf, BrowserError> {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        let path = output_dir.join(format!("{prefix}-{timestamp}.png"));
        self.save_screenshot(&path).await?;
        Ok(path)
    }

    /// Captures a screenshot to an exact path. Used for the named debug
    /// shots that accompany stage failures.
    pub async fn save_screenshot(&mut self, path: &Path) -> Result<(), BrowserError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BrowserError::ScreenshotError(e.to_string()))?;
        }

        let png_data = self
            .client
            .screenshot()
            .await
            .map_err(|e| BrowserError::ScreenshotError(e.to_string()))?;

        fs::write(path, &png_data).map_err(|e| BrowserError::ScreenshotError(e.to_string()))?;
        log::debug!("screenshot saved to {}", path.display());
        Ok(())
    }

    /// Best-effort debug screenshot; logs instead of failing the caller.
    pub async fn debug_screenshot(&mut self, dir: &Path, name: &str) {
        let path = dir.join(name);
        if let Err(e) = self.save_screenshot(&path).await {
            log::warn!("could not save debug screenshot {name}: {e}");
        } else {
            log::info!("debug screenshot saved: {}", path.display());
        }
    }

    /// Opens a new browser tab and switches to it.
    pub async fn open_tab(&mut self, url: &str) -> Result<(), BrowserError> {
        self.client
            .execute("window.open(arguments[0], '_blank');", vec![json!(url)])
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))?;

        tokio::time::sleep(Duration::from_millis(500)).await;

        let handles = self
            .client
            .windows()
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))?;

        if let Some(handle) = handles.last() {
            self.client
                .switch_to_window(handle.clone())
                .await
                .map_err(|e| BrowserError::OperationError(e.to_string()))?;
            self.current_tab = Some(handle.clone());
        }

        Ok(())
    }

    /// Switches back to the first tab (the site session).
    pub async fn switch_to_first_tab(&mut self) -> Result<(), BrowserError> {
        let handles = self
            .client
            .windows()
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))?;

        if let Some(handle) = handles.first() {
            self.client
                .switch_to_window(handle.clone())
                .await
                .map_err(|e| BrowserError::OperationError(e.to_string()))?;
            self.current_tab = Some(handle.clone());
        }
        Ok(())
    }

    /// Shuts down the browser session and closes the WebDriver.
    pub async fn shutdown(self) -> Result<(), BrowserError> {
        self.client
            .close()
            .await
            .map_err(|e| BrowserError::OperationError(e.to_string()))
    }
}
