use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use rsync_proxy::{send_reload_request, Args, ProxyServer};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.version {
        print_version();
        return;
    }

    if args.reload {
        // One-shot mode: ask a running proxy to reload and echo its
        // answer; no logging setup, the body goes straight through.
        match send_reload_request(&args.web_listen_addr).await {
            Ok((status, body)) => {
                if status < 300 {
                    print!("{body}");
                } else {
                    eprint!("{body}");
                    process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = init_logging(args.verbosity) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    info!("Starting rsync proxy");

    let mut server = ProxyServer::new(args.config);
    server.listen_addr = args.listen_addr;
    server.http_listen_addr = args.web_listen_addr;
    server.read_timeout = Duration::from_secs(60);
    server.write_timeout = Duration::from_secs(60);

    if let Err(e) = server.load_config().await {
        error!("Load config: {e}");
        process::exit(1);
    }

    if let Err(e) = server.bind().await {
        error!("Bind: {e}");
        process::exit(1);
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping accept loops");
            shutdown.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        process::exit(1);
    }

    info!("Server shutdown complete");
}

/// Initialize tracing from the -v level, overridable with RUST_LOG
fn init_logging(verbosity: u8) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let mut filter_str = format!("rsync_proxy={level},hyper=warn,tokio=warn");
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        filter_str = env_filter;
    }

    let filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| format!("Invalid log filter '{filter_str}': {e}"))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Build metadata as one JSON line, in the spirit of `--version`
/// flags that get scraped by deployment tooling.
fn print_version() {
    let info = serde_json::json!({
        "Version": env!("CARGO_PKG_VERSION"),
        "GitCommit": option_env!("GIT_COMMIT").unwrap_or("unknown"),
        "BuildDate": option_env!("BUILD_DATE").unwrap_or("unknown"),
        "Platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
    });
    println!("{info}");
}
