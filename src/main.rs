use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use azauth::auth::{AuthMethod, Session, TokenManager, TokenResult};
use azauth::cache::{CacheManager, FileCacheProvider};
use azauth::config::{self, CacheCommand, CliArgs, Command, OutputFormat, TokenArgs};
use azauth::error::{AuthError, Result};
use azauth::providers::DefaultCredentialFactory;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::load();

    // Initialize logging with the configured level; stdout carries the token
    let log_level = args.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let cache = Arc::new(CacheManager::new(
        Arc::new(FileCacheProvider),
        args.cache_root(),
    ));

    let result = match &args.command {
        Command::Token(token_args) => run_token(token_args, cache, &cancel).await,
        Command::Cache { command } => run_cache(command, &cache).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if !e.is_failure() => {
            tracing::debug!("{}", e);
            ExitCode::from(e.exit_code())
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run_token(
    args: &TokenArgs,
    cache: Arc<CacheManager>,
    cancel: &CancellationToken,
) -> Result<()> {
    let request = args.to_request()?;
    tracing::info!(method = request.method.name(), "Acquiring token");

    let manager = TokenManager::new(
        Arc::new(DefaultCredentialFactory::new()),
        Arc::new(Session::new()),
    )
    .with_cache_manager(cache);

    let result = match request.method {
        AuthMethod::DeviceCode { .. } => {
            let flow = manager.get_token_device_code(&request, cancel)?;
            flow.run(|message| eprintln!("{}", message)).await?
        }
        _ => manager.get_token(&request, cancel).await?,
    };

    if let Some(name) = &args.save_to_cache {
        manager.save_to_cache(&request, name, &result).await?;
    }

    print_token(&result, args.output)
}

fn print_token(result: &TokenResult, output: OutputFormat) -> Result<()> {
    tracing::info!(
        identity = result.identity().unwrap_or("unknown"),
        tenant_id = result.tenant_id().unwrap_or("unknown"),
        "✅ Token acquired (token: {}...)",
        token_preview(result.token())
    );

    match output {
        OutputFormat::Token => println!("{}", result.token()),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(result)
                .map_err(|e| AuthError::Internal(e.into()))?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn token_preview(token: &str) -> String {
    token.chars().take(8).collect()
}

async fn run_cache(command: &CacheCommand, cache: &CacheManager) -> Result<()> {
    match command {
        CacheCommand::List { filter, details } => {
            let caches = cache.list(filter.as_deref(), *details).await?;
            let json = serde_json::to_string_pretty(&caches)
                .map_err(|e| AuthError::Internal(e.into()))?;
            println!("{}", json);
        }
        CacheCommand::Clear { name, force, yes } => {
            if *force {
                if !*yes && !config::confirm_remove(name)? {
                    tracing::info!("Keeping token cache '{}'", name);
                    return Ok(());
                }
                cache.remove(name).await?;
            } else {
                let removed = cache.clear(name).await?;
                tracing::info!("Signed {} account(s) out of token cache '{}'", removed, name);
            }
        }
    }
    Ok(())
}

/// Cancel in-flight work on Ctrl+C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, cancelling...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, cancelling...");
        },
    }
    cancel.cancel();
}
