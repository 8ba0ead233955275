use autobrowse_core::types::{FingerprintConfig, ProxyConfig};
use autobrowse_core::LaunchConfig;
use std::path::PathBuf;

use super::{open_app, short_id, truncate};

pub struct CreateOptions {
    pub name: String,
    pub engine: Option<String>,
    pub executable: Option<String>,
    pub headed: bool,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
}

pub async fn create(opts: CreateOptions) -> anyhow::Result<()> {
    let app = open_app().await?;
    let launch = LaunchConfig {
        engine: opts.engine,
        executable: opts.executable,
        proxy: opts.proxy.map(|server| ProxyConfig {
            server,
            username: None,
            password: None,
        }),
        fingerprint: FingerprintConfig {
            user_agent: opts.user_agent,
            locale: opts.locale,
            ..Default::default()
        },
        headless: opts.headed.then_some(false),
        ..Default::default()
    };
    let profile = app.browsers.create(&opts.name, launch).await?;
    println!("✓ Created browser profile {} ({})", profile.name, profile.id);
    Ok(())
}

pub async fn list() -> anyhow::Result<()> {
    let app = open_app().await?;
    let profiles = app.browsers.list().await?;
    if profiles.is_empty() {
        println!("No browser profiles. Create one with `autobrowse browser create <name>`.");
        return Ok(());
    }

    println!("{:<10} {:<24} {:<10} Last error", "ID", "Name", "Status");
    println!("{}", "-".repeat(72));
    for p in profiles {
        println!(
            "{:<10} {:<24} {:<10} {}",
            short_id(&p.id),
            truncate(&p.name, 24),
            p.status,
            p.last_error.as_deref().map(|e| truncate(e, 40)).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

/// Open the browser and keep it running until Ctrl-C.
pub async fn open(id: String) -> anyhow::Result<()> {
    let app = open_app().await?;
    app.browsers.open(&id).await?;
    let pid = app.browsers.pid(&id).await;
    println!(
        "✓ Browser {} running (pid {}). Press Ctrl-C to close.",
        id,
        pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
    );
    tokio::signal::ctrl_c().await?;
    app.shutdown().await;
    Ok(())
}

/// A fresh process owns no browsers, so this only clears an error status.
pub async fn close(id: String) -> anyhow::Result<()> {
    let app = open_app().await?;
    app.browsers.close(&id).await?;
    println!("✓ Browser {} is {}", id, app.browsers.status(&id).await?);
    Ok(())
}

pub async fn status(id: String) -> anyhow::Result<()> {
    let app = open_app().await?;
    let profile = app.browsers.get(&id).await?;
    println!("Profile:  {} ({})", profile.name, profile.id);
    println!("Status:   {}", profile.status);
    if let Some(err) = &profile.last_error {
        println!("Error:    {}", err);
    }
    let data_dir = profile
        .launch
        .data_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| app.paths.profile_data_dir(&profile.id));
    println!("Data dir: {}", data_dir.display());
    println!("Launch:   {}", serde_json::to_string(&profile.launch)?);
    Ok(())
}

pub async fn delete(id: String) -> anyhow::Result<()> {
    let app = open_app().await?;
    app.browsers.delete(&id).await?;
    println!("✓ Deleted browser profile {}", id);
    Ok(())
}
