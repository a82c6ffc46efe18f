use anyhow::Result;
use pocketsync::auth::ScopeLevel;
use pocketsync::config::EngineConfig;
use pocketsync::error::RemoteError;
use pocketsync::sync::{PullOptions, SyncEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pocketsync=info".into()),
        )
        .init();

    let config = match std::env::var("POCKETSYNC_CONFIG") {
        Ok(path) => pocketsync::config::load_config(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path, e))?,
        Err(_) => EngineConfig::default(),
    };

    let redirect_uri = std::env::var("POCKETSYNC_REDIRECT_URI")
        .unwrap_or_else(|_| "http://127.0.0.1:49152/callback".to_string());

    // The engine is the application's context object: built once here,
    // passed by reference everywhere else
    let engine = SyncEngine::initialize(&config, redirect_uri)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("status") => {
            let status = engine.check_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some("connect") => {
            let folder_id = args.get(1).ok_or_else(|| anyhow::anyhow!("usage: connect <folder-id>"))?;
            report(engine.connect_folder(folder_id).await.map(|info| {
                println!("connected to folder '{}'", info.name);
            }));
        }
        Some("connect-file") => {
            let file_id = args.get(1).ok_or_else(|| anyhow::anyhow!("usage: connect-file <file-id>"))?;
            report(engine.connect_shared_file(file_id).await);
        }
        Some("push") => report(engine.push().await),
        Some("pull") => {
            let options = PullOptions {
                acknowledge_local_loss: args.iter().any(|a| a == "--acknowledge-local-loss"),
            };
            report(engine.pull(options).await);
        }
        Some("disconnect") => report(engine.disconnect().await),
        Some("auth-url") => {
            let level = match args.get(1).map(String::as_str) {
                Some("extended") => ScopeLevel::Extended,
                _ => ScopeLevel::Standard,
            };
            report(engine.get_authorization_url(level).map(|url| println!("{}", url)));
        }
        Some("callback") => {
            let code = args.get(1).ok_or_else(|| anyhow::anyhow!("usage: callback <code> <state>"))?;
            let state = args.get(2).map(String::as_str).unwrap_or_default();
            report(engine.handle_callback(code, state).await);
        }
        _ => {
            eprintln!(
                "usage: pocketsync <status|connect|connect-file|push|pull|disconnect|auth-url|callback>"
            );
            std::process::exit(2);
        }
    }

    Ok(())
}

fn report<T>(result: Result<T, RemoteError>) {
    if let Err(e) = result {
        eprintln!("error: {}", e);
        if let Some(hint) = e.remediation() {
            eprintln!("hint: {}", hint);
        }
        std::process::exit(1);
    }
}
