mod filters;
mod mail_move_rules;
mod mail_reader;
mod monitor;
mod settings;
mod spam_filter;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use crate::filters::FilterChain;
use crate::mail_move_rules::build_rules;
use crate::mail_reader::encryption::EncryptedPasswordStore;
use crate::mail_reader::idle::ChangeDetector;
use crate::mail_reader::imap::ImapConnector;
use crate::mail_reader::session::{CredentialSource, Credentials, SessionHandle, StaticCredentials};
use crate::monitor::{Monitor, MonitorOptions};
use crate::settings::{load_settings, Config, DEFAULT_SETTINGS_PATH};
use crate::spam_filter::SpamFilter;

/// Watches an IMAP mailbox and sorts new mail as it arrives.
#[derive(Debug, Parser)]
#[command(name = "mailsift", version, about)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// IMAP server, overrides the settings file
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Mailbox to watch
    #[arg(short, long)]
    mailbox: Option<String>,

    /// Ignore the checkpoint and only handle mail arriving from now on
    #[arg(long)]
    no_catchup: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.imap.server = host.clone();
        }
        if let Some(username) = &self.username {
            config.imap.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.imap.password = Some(password.clone());
        }
        if let Some(mailbox) = &self.mailbox {
            config.imap.mailbox = mailbox.clone();
        }
        if self.no_catchup {
            config.monitor.catchup = false;
        }
    }
}

/// `--verbose` wins, then `LOGLEVEL`, then the settings file.
fn log_level(cli: &Cli, config: &Config) -> LevelFilter {
    if cli.verbose {
        return LevelFilter::Debug;
    }
    std::env::var("LOGLEVEL")
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .or_else(|| LevelFilter::from_str(&config.logging.level).ok())
        .unwrap_or(LevelFilter::Info)
}

fn setup_logger(level: LevelFilter, file: Option<&Path>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // async-imap is chatty at debug
        .level_for("async_imap", LevelFilter::Info)
        .chain(std::io::stderr());

    if let Some(path) = file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// What is printed when the settings cannot be loaded.
fn settings_error_report(err: &anyhow::Error) -> String {
    format!(
        "mailsift: {:#}\nBacktrace:\n{:?}",
        err,
        backtrace::Backtrace::new()
    )
}

fn build_filter_chain(config: &Config) -> Result<FilterChain> {
    let mut chain = FilterChain::new();

    if config.spam_filter.enabled {
        chain.register(Box::new(SpamFilter::new(&config.spam_filter)?), None);
    }
    for rule in build_rules(&config.mail_mover)? {
        chain.register(Box::new(rule), None);
    }

    Ok(chain)
}

fn credential_source(config: &Config) -> Arc<dyn CredentialSource> {
    let imap = &config.imap;
    match &imap.password {
        Some(password) => Arc::new(StaticCredentials(Credentials {
            host: imap.server.clone(),
            username: imap.username.clone(),
            password: password.clone(),
        })),
        None => Arc::new(EncryptedPasswordStore {
            host: imap.server.clone(),
            username: imap.username.clone(),
            password_file: imap.password_store.password_file.clone(),
            key_file: imap.password_store.key_file.clone(),
        }),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_settings(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            // No logger yet, settings decide where it goes
            eprintln!("{}", settings_error_report(&e));
            return ExitCode::from(2);
        }
    };
    cli.apply(&mut config);

    if let Err(e) = setup_logger(log_level(&cli, &config), config.logging.file.as_deref()) {
        eprintln!("mailsift: cannot set up logging: {}", e);
        return ExitCode::from(2);
    }

    let chain = match build_filter_chain(&config) {
        Ok(chain) => chain,
        Err(e) => {
            error!("Invalid filter settings: {:#}", e);
            return ExitCode::from(2);
        }
    };
    if chain.is_empty() {
        warn!("No filters configured, new mail is only logged");
    } else {
        info!("Filters: {}", chain.names().join(", "));
    }

    let connector = ImapConnector {
        port: config.imap.port,
        connect_timeout: config.imap.connect_timeout(),
        command_timeout: config.imap.command_timeout(),
    };
    let session = SessionHandle::new(connector, credential_source(&config), config.imap.mailbox.clone());
    let detector = ChangeDetector::new(Duration::from_secs(config.monitor.idle_renew_seconds));
    debug!("IDLE is renewed every {:?}", detector.renew_interval());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let mut monitor = Monitor::new(
        session,
        detector,
        chain,
        MonitorOptions::from(&config.monitor),
        cancel,
    );

    match monitor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}
