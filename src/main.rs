use clap::{Parser, Subcommand};
use iptv_proxy::config::Config;
use iptv_proxy::supervisor::{self, PidFile, StopOutcome};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iptv-proxy", about = "IPTV stream relay proxy", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Start {
        /// Detach from the controlling terminal (unix only)
        #[arg(long)]
        detach: bool,
    },
    /// Stop a running instance
    Stop,
    /// Report whether an instance is running
    Status,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let is_error = e.use_stderr();
            let _ = e.print();
            std::process::exit(if is_error { 1 } else { 0 });
        }
    };

    let code = match cli.command {
        Command::Start { detach } => cmd_start(detach),
        Command::Stop => cmd_stop(),
        Command::Status => cmd_status(),
    };
    std::process::exit(code);
}

fn cmd_start(detach: bool) -> i32 {
    let config = Arc::new(Config::from_env());
    let pidfile = PidFile::new(&config.pid_file);

    if let Err(e) = supervisor::ensure_not_running(&pidfile) {
        eprintln!("{}", e);
        return 1;
    }

    // Fork before the runtime exists; tokio does not survive a fork.
    if detach {
        if let Err(e) = supervisor::detach() {
            eprintln!("failed to detach: {}", e);
            return 1;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = pidfile.write(std::process::id()) {
        eprintln!("failed to write pid file {}: {}", config.pid_file.display(), e);
        return 1;
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(iptv_proxy::run_server(config.clone())));

    pidfile.remove();
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{:#}", e);
            1
        }
    }
}

fn cmd_stop() -> i32 {
    let config = Config::from_env();
    let pidfile = PidFile::new(&config.pid_file);
    match supervisor::stop(&pidfile, config.stop_timeout) {
        Ok(StopOutcome::Graceful) => {
            println!("iptv-proxy stopped");
            0
        }
        Ok(StopOutcome::Forced) => {
            println!("iptv-proxy stopped (forced after timeout)");
            0
        }
        Err(_) => {
            println!("iptv-proxy is not running");
            1
        }
    }
}

fn cmd_status() -> i32 {
    let config = Config::from_env();
    let pidfile = PidFile::new(&config.pid_file);
    match supervisor::status(&pidfile) {
        Some(pid) => println!("iptv-proxy is running (pid {})", pid),
        None => println!("iptv-proxy is stopped"),
    }
    0
}
