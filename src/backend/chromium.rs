//! chromiumoxide-backed implementation of the browser port.
//!
//! Input goes through raw CDP `Input.dispatch*` commands so clicks and wheel
//! events are trusted events at exact coordinates, matching how the runtime
//! targets elements (bbox centers from snapshots, not CSS selectors).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::page::{Page, ScreenshotParams};
use chromiumoxide_cdp::cdp::browser_protocol::browser::{
    GrantPermissionsParams, PermissionType, ResetPermissionsParams,
};
use chromiumoxide_cdp::cdp::browser_protocol::emulation::SetGeolocationOverrideParams;
use chromiumoxide_cdp::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton as CdpMouseButton,
};
use chromiumoxide_cdp::cdp::browser_protocol::page::CaptureScreenshotFormat;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{BackendCapabilities, BackendError, BrowserBackend, MouseButton, ReadyState};
use super::launch::BrowserHandle;
use crate::models::{Geolocation, TabInfo};

/// Backend over a single chromiumoxide [`Page`].
///
/// Tab and permission operations need the owning browser; construct with
/// [`ChromiumBackend::with_browser`] to enable them.
pub struct ChromiumBackend {
    page: Mutex<Page>,
    browser: Option<Arc<Mutex<BrowserHandle>>>,
}

impl ChromiumBackend {
    pub fn new(page: Page) -> Self {
        Self {
            page: Mutex::new(page),
            browser: None,
        }
    }

    pub fn with_browser(page: Page, browser: Arc<Mutex<BrowserHandle>>) -> Self {
        Self {
            page: Mutex::new(page),
            browser: Some(browser),
        }
    }

    async fn page(&self) -> Page {
        self.page.lock().await.clone()
    }

    async fn dispatch_mouse(
        &self,
        params: DispatchMouseEventParams,
    ) -> Result<(), BackendError> {
        let page = self.page().await;
        page.execute(params)
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(())
    }

    fn cdp_button(button: MouseButton) -> CdpMouseButton {
        match button {
            MouseButton::Left => CdpMouseButton::Left,
            MouseButton::Middle => CdpMouseButton::Middle,
            MouseButton::Right => CdpMouseButton::Right,
        }
    }

    fn tab_id(page: &Page) -> String {
        // Target ids are string newtypes; serialize rather than depend on
        // their internals.
        serde_json::to_value(page.target_id())
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default()
    }

    async fn tab_info(page: &Page, active: bool) -> TabInfo {
        let url = page.url().await.ok().flatten().unwrap_or_default();
        let title = page.get_title().await.ok().flatten();
        TabInfo {
            id: Self::tab_id(page),
            url,
            title,
            active,
        }
    }

    fn browser_handle(&self) -> Result<&Arc<Mutex<BrowserHandle>>, BackendError> {
        self.browser
            .as_ref()
            .ok_or(BackendError::UnsupportedCapability("tabs"))
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn get_url(&self) -> Result<String, BackendError> {
        let page = self.page().await;
        page.url()
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?
            .ok_or_else(|| BackendError::Browser("page has no url".to_string()))
    }

    async fn eval(&self, code: &str) -> Result<Value, BackendError> {
        let page = self.page().await;
        let result = page
            .evaluate(code.to_string())
            .await
            .map_err(|e| BackendError::Eval(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn wait_ready_state(
        &self,
        state: ReadyState,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.eval("document.readyState").await {
                Ok(Value::String(s))
                    if ReadyState::parse(&s).is_some_and(|current| current >= state) =>
                {
                    return Ok(());
                }
                Ok(_) => {}
                // Mid-navigation evals fail transiently; keep polling.
                Err(e) => debug!("readyState poll failed: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::ReadyStateTimeout {
                    state,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), BackendError> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(BackendError::Browser)?;
        self.dispatch_mouse(params).await
    }

    async fn mouse_click(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
    ) -> Result<(), BackendError> {
        let button = Self::cdp_button(button);
        let press = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(button.clone())
            .click_count(click_count as i64)
            .build()
            .map_err(BackendError::Browser)?;
        let release = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(button)
            .click_count(click_count as i64)
            .build()
            .map_err(BackendError::Browser)?;
        self.dispatch_mouse(press).await?;
        self.dispatch_mouse(release).await
    }

    async fn wheel(
        &self,
        delta_y: f64,
        x: Option<f64>,
        y: Option<f64>,
    ) -> Result<(), BackendError> {
        // Wheel events need a position; default to a point near the viewport
        // center so nested scrollers under the cursor receive the event.
        let (cx, cy) = match (x, y) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                let info = self.page_info().await.unwrap_or_default();
                (
                    x.unwrap_or(info.width / 2.0),
                    y.unwrap_or(info.height / 2.0),
                )
            }
        };
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(cx)
            .y(cy)
            .delta_x(0.0)
            .delta_y(delta_y)
            .build()
            .map_err(BackendError::Browser)?;
        self.dispatch_mouse(params).await
    }

    async fn type_text(&self, text: &str) -> Result<(), BackendError> {
        let page = self.page().await;
        page.execute(InsertTextParams::new(text))
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BackendError> {
        let page = self.page().await;
        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key.to_string());
        // Printable single characters also carry text so inputs receive them.
        if key.chars().count() == 1 {
            down = down.text(key.to_string());
        }
        let down = down.build().map_err(BackendError::Browser)?;
        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key.to_string())
            .build()
            .map_err(BackendError::Browser)?;
        page.execute(down)
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        page.execute(up)
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BackendError> {
        let page = self.page().await;
        page.screenshot(
            ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .build(),
        )
        .await
        .map_err(|e| BackendError::Screenshot(e.to_string()))
    }

    async fn screenshot_jpeg(&self, quality: Option<u8>) -> Result<Vec<u8>, BackendError> {
        let page = self.page().await;
        let mut builder = ScreenshotParams::builder().format(CaptureScreenshotFormat::Jpeg);
        if let Some(quality) = quality {
            builder = builder.quality(quality.clamp(1, 100) as i64);
        }
        page.screenshot(builder.build())
            .await
            .map_err(|e| BackendError::Screenshot(e.to_string()))
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            tabs: self.browser.is_some(),
            evaluate_js: true,
            downloads: false,
            filesystem_tools: false,
            keyboard: true,
            permissions: self.browser.is_some(),
        }
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BackendError> {
        let browser = self.browser_handle()?;
        let guard = browser.lock().await;
        let pages = guard
            .browser()
            .pages()
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        drop(guard);
        let active_id = Self::tab_id(&self.page().await);
        let mut tabs = Vec::with_capacity(pages.len());
        for page in &pages {
            let id = Self::tab_id(page);
            tabs.push(Self::tab_info(page, id == active_id).await);
        }
        Ok(tabs)
    }

    async fn open_tab(&self, url: &str) -> Result<TabInfo, BackendError> {
        let browser = self.browser_handle()?;
        let guard = browser.lock().await;
        let page = guard
            .browser()
            .new_page(url)
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        drop(guard);
        let info = Self::tab_info(&page, true).await;
        *self.page.lock().await = page;
        Ok(info)
    }

    async fn switch_tab(&self, tab_id: &str) -> Result<TabInfo, BackendError> {
        let browser = self.browser_handle()?;
        let guard = browser.lock().await;
        let pages = guard
            .browser()
            .pages()
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        drop(guard);
        let page = pages
            .into_iter()
            .find(|p| Self::tab_id(p) == tab_id)
            .ok_or_else(|| BackendError::Browser(format!("no tab with id '{tab_id}'")))?;
        let _ = page.bring_to_front().await;
        let info = Self::tab_info(&page, true).await;
        *self.page.lock().await = page;
        Ok(info)
    }

    async fn close_tab(&self, tab_id: &str) -> Result<TabInfo, BackendError> {
        let browser = self.browser_handle()?;
        let guard = browser.lock().await;
        let pages = guard
            .browser()
            .pages()
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        drop(guard);
        let page = pages
            .into_iter()
            .find(|p| Self::tab_id(p) == tab_id)
            .ok_or_else(|| BackendError::Browser(format!("no tab with id '{tab_id}'")))?;
        let info = Self::tab_info(&page, false).await;
        page.close()
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(info)
    }

    async fn grant_permissions(
        &self,
        permissions: &[String],
        origin: Option<&str>,
    ) -> Result<(), BackendError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or(BackendError::UnsupportedCapability("permissions"))?;
        let mut parsed = Vec::with_capacity(permissions.len());
        for name in permissions {
            match serde_json::from_value::<PermissionType>(Value::String(name.clone())) {
                Ok(p) => parsed.push(p),
                Err(_) => warn!("Unknown permission '{name}', skipping"),
            }
        }
        let mut builder = GrantPermissionsParams::builder().permissions(parsed);
        if let Some(origin) = origin {
            builder = builder.origin(origin.to_string());
        }
        let params = builder.build().map_err(BackendError::Browser)?;
        let guard = browser.lock().await;
        guard
            .browser()
            .execute(params)
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn clear_permissions(&self) -> Result<(), BackendError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or(BackendError::UnsupportedCapability("permissions"))?;
        let guard = browser.lock().await;
        guard
            .browser()
            .execute(ResetPermissionsParams::default())
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn set_geolocation(&self, geolocation: Geolocation) -> Result<(), BackendError> {
        let page = self.page().await;
        let params = SetGeolocationOverrideParams::builder()
            .latitude(geolocation.latitude)
            .longitude(geolocation.longitude)
            .accuracy(geolocation.accuracy.unwrap_or(1.0))
            .build();
        page.execute(params)
            .await
            .map_err(|e| BackendError::Browser(e.to_string()))?;
        Ok(())
    }
}
