//! Launching browser processes and connecting to them over CDP.

use async_trait::async_trait;
use autobrowse_core::config::BrowserConfig;
use autobrowse_core::types::{LaunchConfig, Viewport};
use autobrowse_core::{BrowserProfile, Error, Result};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::cdp::CdpClient;
use crate::page::{CdpPage, PageDriver};

/// Why a browser process went away without being asked to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub reason: String,
}

/// Terminates a launched browser. Dropping the exit receiver before calling `terminate`
/// guarantees no exit event is observed for the teardown.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn terminate(&mut self) -> Result<()>;
}

/// A running browser handed to the process manager.
pub struct LaunchedBrowser {
    pub pid: Option<u32>,
    pub page: Arc<dyn PageDriver>,
    /// Resolves when the process exits or its automation channel disconnects on its own.
    pub exit: oneshot::Receiver<ProcessExit>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, profile: &BrowserProfile, data_dir: &Path) -> Result<LaunchedBrowser>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
}

impl BrowserEngine {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
        }
    }
}

/// Launches Chromium-family browsers with a remote debugging port.
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn viewport(&self, launch: &LaunchConfig) -> Viewport {
        launch.viewport.unwrap_or(Viewport {
            width: self.config.viewport_width,
            height: self.config.viewport_height,
        })
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, profile: &BrowserProfile, data_dir: &Path) -> Result<LaunchedBrowser> {
        let launch = &profile.launch;
        let engine = BrowserEngine::from_str(launch.engine.as_deref().unwrap_or(&self.config.engine));
        let browser_path = launch
            .executable
            .clone()
            .or_else(|| self.config.executable.clone())
            .or_else(|| find_browser_binary(engine))
            .ok_or_else(|| {
                Error::Browser(format!("{} not found. Please install it.", engine.name()))
            })?;

        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Browser(format!("Failed to create user data dir: {}", e)))?;

        let debug_port = find_free_port().await?;
        let headless = launch.headless.unwrap_or(self.config.headless);
        let viewport = self.viewport(launch);
        let args = build_browser_args(launch, debug_port, data_dir, headless, viewport);

        info!(
            profile_id = %profile.id,
            port = debug_port,
            headless,
            browser = engine.name(),
            "Launching browser"
        );

        let mut child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Browser(format!("Failed to launch {}: {}", engine.name(), e)))?;
        let pid = child.id();

        let cdp = match connect_page(debug_port, self.config.launch_timeout_secs).await {
            Ok(cdp) => Arc::new(cdp),
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        if let Some(ua) = &launch.fingerprint.user_agent {
            let params = serde_json::json!({"userAgent": ua});
            if let Err(e) = cdp.send_command("Network.setUserAgentOverride", params).await {
                warn!(error = %e, "Failed to apply user agent override");
            }
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, cdp.disconnected(), exit_tx, kill_rx));

        let page: Arc<dyn PageDriver> = Arc::new(CdpPage::new(cdp.clone(), viewport));
        Ok(LaunchedBrowser {
            pid,
            page,
            exit: exit_rx,
            control: Box::new(ChromeControl {
                cdp,
                kill_tx: Some(kill_tx),
            }),
        })
    }
}

struct ChromeControl {
    cdp: Arc<CdpClient>,
    kill_tx: Option<oneshot::Sender<oneshot::Sender<()>>>,
}

#[async_trait]
impl ProcessControl for ChromeControl {
    async fn terminate(&mut self) -> Result<()> {
        // Graceful close first so the profile directory is flushed
        match tokio::time::timeout(Duration::from_secs(3), self.cdp.close_browser()).await {
            Ok(Err(e)) => debug!("CDP Browser.close failed (may already be closed): {}", e),
            Err(_) => debug!("CDP Browser.close timed out"),
            Ok(Ok(())) => {}
        }
        let Some(kill_tx) = self.kill_tx.take() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(ack_tx).is_err() {
            // Supervisor already saw the process exit
            return Ok(());
        }
        tokio::time::timeout(Duration::from_secs(10), ack_rx)
            .await
            .map_err(|_| Error::Timeout("Browser did not exit within 10s".to_string()))?
            .ok();
        Ok(())
    }
}

/// Owns the child process: reports unexpected exits, or kills on request without reporting.
async fn supervise(
    mut child: Child,
    mut disconnected: watch::Receiver<bool>,
    exit_tx: oneshot::Sender<ProcessExit>,
    kill_rx: oneshot::Receiver<oneshot::Sender<()>>,
) {
    let disconnect = async move {
        loop {
            if *disconnected.borrow() {
                return;
            }
            if disconnected.changed().await.is_err() {
                // Client dropped during our own teardown
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        status = child.wait() => {
            let code = status.as_ref().ok().and_then(|s| s.code());
            let reason = match status {
                Ok(s) => format!("process exited ({})", s),
                Err(e) => format!("process wait failed: {}", e),
            };
            let _ = exit_tx.send(ProcessExit { code, reason });
        }
        _ = disconnect => {
            let _ = child.kill().await;
            let _ = exit_tx.send(ProcessExit {
                code: None,
                reason: "automation channel disconnected".to_string(),
            });
        }
        Ok(ack) = kill_rx => {
            drop(exit_tx);
            let _ = child.kill().await;
            let _ = ack.send(());
        }
    }
}

async fn connect_page(debug_port: u16, timeout_secs: u64) -> Result<CdpClient> {
    wait_for_cdp_ready(debug_port, timeout_secs).await?;
    let page_ws_url = get_page_ws_url(debug_port).await?;
    let cdp = CdpClient::connect(&page_ws_url).await?;
    cdp.enable_domain("Page").await?;
    cdp.enable_domain("Runtime").await?;
    cdp.enable_domain("Network").await?;
    debug!(ws_url = %page_ws_url, "CDP connection established (page target)");
    Ok(cdp)
}

/// Build Chromium command-line arguments for a profile.
pub fn build_browser_args(
    launch: &LaunchConfig,
    debug_port: u16,
    user_data_dir: &Path,
    headless: bool,
    viewport: Viewport,
) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    if let Some(proxy) = &launch.proxy {
        args.push(format!("--proxy-server={}", proxy.server));
    }
    if let Some(ua) = &launch.fingerprint.user_agent {
        args.push(format!("--user-agent={}", ua));
    }
    if let Some(locale) = &launch.fingerprint.locale {
        args.push(format!("--lang={}", locale));
    }
    args.extend(launch.fingerprint.extra_args.iter().cloned());
    args.push(format!("--window-size={},{}", viewport.width, viewport.height));
    args.push("about:blank".to_string());
    args
}

/// Find a browser binary on the system for the given engine.
pub fn find_browser_binary(engine: BrowserEngine) -> Option<String> {
    let candidates = match engine {
        BrowserEngine::Chrome => {
            if cfg!(target_os = "macos") {
                vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "/Applications/Chromium.app/Contents/MacOS/Chromium",
                ]
            } else if cfg!(target_os = "linux") {
                vec![
                    "google-chrome",
                    "google-chrome-stable",
                    "chromium",
                    "chromium-browser",
                    "/usr/bin/google-chrome",
                    "/usr/bin/chromium",
                ]
            } else {
                vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ]
            }
        }
        BrowserEngine::Edge => {
            if cfg!(target_os = "macos") {
                vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
            } else if cfg!(target_os = "linux") {
                vec!["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"]
            } else {
                vec![
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                ]
            }
        }
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok()
        {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Browser(format!("Failed to bind to find free port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Browser(format!("Failed to get local addr: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll /json/version until the debugging endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<String> {
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Timeout(format!(
                "Browser debugging endpoint not ready after {}s",
                timeout_secs
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Resolve the WebSocket URL of the first page target via /json/list.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        for target in &targets {
            if target.get("type").and_then(|v| v.as_str()) == Some("page") {
                if let Some(ws_url) = target.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }
    }

    Err(Error::Browser("No page target found after retries".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobrowse_core::types::{FingerprintConfig, ProxyConfig};
    use std::path::PathBuf;

    #[test]
    fn test_args_include_profile_settings() {
        let launch = LaunchConfig {
            proxy: Some(ProxyConfig {
                server: "socks5://127.0.0.1:1080".to_string(),
                ..Default::default()
            }),
            fingerprint: FingerprintConfig {
                locale: Some("de-DE".to_string()),
                extra_args: vec!["--mute-audio".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let args = build_browser_args(
            &launch,
            9333,
            &PathBuf::from("/tmp/profile"),
            true,
            Viewport { width: 800, height: 600 },
        );
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=socks5://127.0.0.1:1080".to_string()));
        assert!(args.contains(&"--lang=de-DE".to_string()));
        assert!(args.contains(&"--mute-audio".to_string()));
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_headed_has_no_headless_flag() {
        let args = build_browser_args(
            &LaunchConfig::default(),
            9222,
            &PathBuf::from("/tmp/p"),
            false,
            Viewport { width: 1280, height: 720 },
        );
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn test_engine_from_str() {
        assert_eq!(BrowserEngine::from_str("msedge"), BrowserEngine::Edge);
        assert_eq!(BrowserEngine::from_str("anything"), BrowserEngine::Chrome);
    }
}
