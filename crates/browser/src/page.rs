//! Automation surface for one page of a running browser.

use async_trait::async_trait;
use autobrowse_core::types::Viewport;
use autobrowse_core::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cdp::CdpClient;

/// Page primitives the execution engine exposes to scripts.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    /// Number of elements matching a CSS selector.
    async fn query_count(&self, selector: &str) -> Result<usize>;
    async fn click(&self, selector: &str) -> Result<()>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;
    /// Text content of the first match, `None` if nothing matches.
    async fn text(&self, selector: &str) -> Result<Option<String>>;
    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>>;
    /// Base64-encoded PNG.
    async fn screenshot(&self, full_page: bool) -> Result<String>;
    async fn evaluate(&self, expression: &str) -> Result<Value>;
    /// Clear history, storage and cookies, restore the viewport and reload.
    async fn reset_state(&self) -> Result<()>;
}

pub struct CdpPage {
    cdp: Arc<CdpClient>,
    viewport: Viewport,
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

impl CdpPage {
    pub fn new(cdp: Arc<CdpClient>, viewport: Viewport) -> Self {
        Self { cdp, viewport }
    }

    async fn require_match(&self, selector: &str) -> Result<()> {
        if self.query_count(selector).await? == 0 {
            return Err(Error::Browser(format!("No element matches '{}'", selector)));
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.cdp.navigate(url).await?;
        // Page.navigate returns on commit; wait for the document to settle
        for _ in 0..50 {
            let state = self.cdp.evaluate_js("document.readyState").await?;
            if state.as_str() == Some("complete") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let value = self.cdp.evaluate_js("location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn query_count(&self, selector: &str) -> Result<usize> {
        let expr = format!("document.querySelectorAll({}).length", js_str(selector));
        let value = self.cdp.evaluate_js(&expr).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.require_match(selector).await?;
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()",
            js_str(selector)
        );
        self.cdp.evaluate_js(&expr).await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.require_match(selector).await?;
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); el.focus(); if ('value' in el) el.value = ''; return true; }})()",
            js_str(selector)
        );
        self.cdp.evaluate_js(&expr).await?;
        self.cdp.insert_text(text).await
    }

    async fn text(&self, selector: &str) -> Result<Option<String>> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); return el ? (el.innerText ?? el.textContent) : null; }})()",
            js_str(selector)
        );
        let value = self.cdp.evaluate_js(&expr).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.getAttribute({}) : null; }})()",
            js_str(selector),
            js_str(name)
        );
        let value = self.cdp.evaluate_js(&expr).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    async fn screenshot(&self, full_page: bool) -> Result<String> {
        self.cdp.screenshot(full_page).await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.cdp.evaluate_js(expression).await
    }

    async fn reset_state(&self) -> Result<()> {
        let origin = self.cdp.evaluate_js("location.origin").await?;
        self.cdp.reset_navigation_history().await?;
        self.cdp
            .evaluate_js("try { localStorage.clear(); sessionStorage.clear(); } catch (e) {} true")
            .await?;
        if let Some(origin) = origin.as_str().filter(|o| o.starts_with("http")) {
            self.cdp.clear_origin_storage(origin).await?;
        }
        self.cdp.clear_cookies().await?;
        self.cdp
            .set_viewport(self.viewport.width, self.viewport.height)
            .await?;
        self.cdp.reload().await?;
        debug!("Page state reset");
        Ok(())
    }
}
