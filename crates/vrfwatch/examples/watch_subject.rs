//! Example: watch one subject until it resolves, times out, or fails; print the terminal
//! status as JSON.
//!
//! Usage: cargo run -p vrfwatch --example watch_subject -- --config monitor.json --subject 42 [--request-id 0x...]
//!
//! Ctrl-C cancels the session (reported as `Failed` with reason `cancelled`).

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vrfwatch::{MonitorConfig, RequestId, RpcLedger, SessionRegistry, SubjectId};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vrfwatch=info")))
        .init();
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::new();
    let mut subject = String::new();
    let mut request_id = String::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = args.get(i).cloned().unwrap_or_default();
            }
            "--subject" => {
                i += 1;
                subject = args.get(i).cloned().unwrap_or_default();
            }
            "--request-id" => {
                i += 1;
                request_id = args.get(i).cloned().unwrap_or_default();
            }
            _ => {}
        }
        i += 1;
    }
    if config_path.is_empty() || subject.is_empty() {
        eprintln!("Usage: watch_subject --config FILE --subject ID [--request-id 0xID]");
        std::process::exit(1);
    }
    let config = MonitorConfig::from_json_file(&config_path)?;
    let subject: SubjectId = subject.parse()?;
    let request_id: Option<RequestId> = if request_id.is_empty() {
        None
    } else {
        Some(request_id.parse()?)
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let ledger = Arc::new(RpcLedger::new(&config).context("build RPC ledger")?);
        let registry = Arc::new(SessionRegistry::new(ledger, config)?);
        let reaper = registry.spawn_reaper(Duration::from_secs(60));

        let mut handle = registry.start_session(subject, request_id).await?;
        let status = tokio::select! {
            s = handle.wait() => s,
            _ = tokio::signal::ctrl_c() => {
                registry.cancel(&subject).await?;
                handle.wait().await
            }
        };
        println!("{}", serde_json::to_string_pretty(&status)?);

        registry.shutdown().await;
        let _ = reaper.await;
        Ok::<_, anyhow::Error>(())
    })
}
