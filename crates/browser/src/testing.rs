//! In-process doubles for the launcher and page, used by this crate's and downstream tests.

use async_trait::async_trait;
use autobrowse_core::{BrowserProfile, Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::launcher::{BrowserLauncher, LaunchedBrowser, ProcessControl, ProcessExit};
use crate::page::PageDriver;

/// Page that records every call and serves canned element text.
#[derive(Default)]
pub struct FakePage {
    calls: Mutex<Vec<String>>,
    url: Mutex<String>,
    elements: Mutex<HashMap<String, String>>,
    fail_reset: AtomicBool,
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            url: Mutex::new("about:blank".to_string()),
            ..Default::default()
        }
    }

    pub fn set_element(&self, selector: &str, text: &str) {
        if let Ok(mut elements) = self.elements.lock() {
            elements.insert(selector.to_string(), text.to_string());
        }
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn reset_count(&self) -> usize {
        self.calls().iter().filter(|c| *c == "reset").count()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn element(&self, selector: &str) -> Option<String> {
        self.elements
            .lock()
            .ok()
            .and_then(|e| e.get(selector).cloned())
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.record(format!("navigate {}", url));
        if let Ok(mut current) = self.url.lock() {
            *current = url.to_string();
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().map(|u| u.clone()).unwrap_or_default())
    }

    async fn query_count(&self, selector: &str) -> Result<usize> {
        Ok(usize::from(self.element(selector).is_some()))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.record(format!("click {}", selector));
        match self.element(selector) {
            Some(_) => Ok(()),
            None => Err(Error::Browser(format!("No element matches '{}'", selector))),
        }
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.record(format!("type {} {}", selector, text));
        self.set_element(selector, text);
        Ok(())
    }

    async fn text(&self, selector: &str) -> Result<Option<String>> {
        Ok(self.element(selector))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>> {
        Ok(self.element(&format!("{}[{}]", selector, name)))
    }

    async fn screenshot(&self, _full_page: bool) -> Result<String> {
        self.record("screenshot".to_string());
        Ok("iVBORw0KGgo=".to_string())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.record(format!("evaluate {}", expression));
        Ok(Value::String(expression.to_string()))
    }

    async fn reset_state(&self) -> Result<()> {
        self.record("reset".to_string());
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(Error::Browser("reset failed".to_string()));
        }
        Ok(())
    }
}

/// Launcher that never spawns a process. Exit events are fired by the test.
pub struct FakeLauncher {
    page: Arc<FakePage>,
    failure: Mutex<Option<String>>,
    exits: Mutex<Vec<oneshot::Sender<ProcessExit>>>,
    launches: AtomicUsize,
    terminations: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::with_page(Arc::new(FakePage::new()))
    }

    pub fn with_page(page: Arc<FakePage>) -> Self {
        Self {
            page,
            failure: Mutex::new(None),
            exits: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn page(&self) -> Arc<FakePage> {
        self.page.clone()
    }

    /// Make subsequent launches fail with this cause.
    pub fn fail_with(&self, cause: &str) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(cause.to_string());
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Simulate the most recently launched process exiting on its own.
    /// Returns false if nobody was listening any more.
    pub fn exit_latest(&self, reason: &str) -> bool {
        let Some(tx) = self.exits.lock().ok().and_then(|mut e| e.pop()) else {
            return false;
        };
        tx.send(ProcessExit {
            code: Some(1),
            reason: reason.to_string(),
        })
        .is_ok()
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _profile: &BrowserProfile, _data_dir: &Path) -> Result<LaunchedBrowser> {
        if let Some(cause) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(Error::Browser(cause));
        }
        let count = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut exits) = self.exits.lock() {
            exits.push(tx);
        }
        Ok(LaunchedBrowser {
            pid: Some(10_000 + count as u32),
            page: self.page.clone(),
            exit: rx,
            control: Box::new(FakeControl {
                terminations: self.terminations.clone(),
            }),
        })
    }
}

struct FakeControl {
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn terminate(&mut self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
