//! nftsync - keep nftables converged to a declared list of allowed services
//!
//! Designed to be run repeatedly from a timer. Every run is serialized by a
//! lock file, reads the live filter state afresh, and only ever adds what is
//! missing.
//!
//! # Usage
//!
//! ```bash
//! nftsync apply                  # Ensure baseline, add missing service ports
//! nftsync apply --dry-run        # Report what would be added
//! nftsync generate               # Publish <base_dir>/rules/firewall.rules
//! nftsync generate --print       # Render the artifact to stdout
//! nftsync check                  # Report drift without changing anything
//! nftsync remove 8080 -p tcp     # Delete one port from its set
//! nftsync init                   # Write the default config.json
//! nftsync flush --yes            # Flush the whole ruleset
//! nftsync lock-path              # Print the resolved lock path
//! ```

use clap::{Parser, Subcommand};
use nftsync::audit::{AuditLog, EventType};
use nftsync::config::{AppConfig, default_config_path, load_config, save_config};
use nftsync::core::artifact;
use nftsync::core::gateway::FilterGateway;
use nftsync::core::nft::SystemNft;
use nftsync::core::reconcile::{Outcome, Reconciler};
use nftsync::core::service::{DesiredPolicy, load_policy};
use nftsync::lock::{LockGuard, resolve_lock_path};
use nftsync::notify::{CommandNotifier, LogNotifier, Notifier};
use nftsync::{Error, Protocol, Result, Service, utils};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, info, warn};

shadow_rs::shadow!(build);

/// Exit code after SIGINT/SIGTERM
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "nftsync")]
#[command(version = build::PKG_VERSION)]
#[command(about = "Keep nftables converged to a declared list of allowed services", long_about = None)]
struct Cli {
    /// Configuration file (default: <config_dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Base directory for the policy file and the rule artifact
    #[arg(long, global = true, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure the baseline exists and add missing service ports
    Apply {
        /// Report what would change without modifying anything
        #[arg(long)]
        dry_run: bool,
        /// Seed newly created sets with the policy's ports
        #[arg(long)]
        seed: bool,
    },
    /// Render the rule artifact and publish it atomically
    Generate {
        /// Write the artifact to stdout instead of publishing it
        #[arg(long)]
        print: bool,
    },
    /// Report baseline objects and services missing from the live state
    Check,
    /// Remove one port from its protocol's set
    Remove {
        port: u16,
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
        /// Report whether the port would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Flush the entire ruleset
    Flush {
        /// Confirm the flush
        #[arg(long)]
        yes: bool,
    },
    /// Print the lock file path for this user
    LockPath,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = utils::ensure_dirs();
    init_logging(cli.verbose);

    tracing::debug!(
        "nftsync {} ({} built {})",
        build::PKG_VERSION,
        build::SHORT_COMMIT,
        build::BUILD_TIME
    );

    // Held until the end of main, outliving the runtime and any cancelled work
    let guard = match cli.command {
        Commands::LockPath => None,
        _ => match LockGuard::acquire(resolve_lock_path()) {
            Ok(guard) => Some(guard),
            Err(e) => return report_error(&e),
        },
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return report_error(&Error::Io(e)),
    };

    let code = runtime.block_on(async {
        tokio::select! {
            result = run(cli) => result.unwrap_or_else(|e| report_error(&e)),
            signal = shutdown_signal() => {
                warn!("Received {signal}, stopping");
                eprintln!("Interrupted by {signal}");
                ExitCode::from(EXIT_INTERRUPTED)
            }
        }
    });

    drop(runtime);
    drop(guard);
    code
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let builder = tracing_subscriber::fmt().with_max_level(level);

    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("nftsync.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
            return;
        }
    }
    builder.with_writer(std::io::stderr).init();
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        () = terminate => "SIGTERM",
    }
}

fn report_error(e: &Error) -> ExitCode {
    error!("{e}");
    eprintln!("Error: {e}");
    ExitCode::from(e.exit_code())
}

async fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path).await,
        None => AppConfig::default(),
    };
    if let Some(base_dir) = &cli.base_dir {
        config.base_dir.clone_from(base_dir);
    }
    config.validate()?;
    Ok(config)
}

async fn load_desired(config: &AppConfig) -> Result<DesiredPolicy> {
    let load = load_policy(&config.services_path()).await?;
    if !load.skipped.is_empty() {
        warn!("Skipped {} malformed policy entries", load.skipped.len());
    }
    Ok(load.policy)
}

async fn init_config(cli: &Cli, force: bool) -> Result<ExitCode> {
    let path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or_else(|| Error::Config("cannot determine the config directory".to_string()))?;
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    let mut config = AppConfig::default();
    if let Some(base_dir) = &cli.base_dir {
        config.base_dir.clone_from(base_dir);
    }
    save_config(&config, &path).await?;
    info!("Wrote {}", path.display());
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// What every command touching the live state shares
struct Context {
    config: AppConfig,
    notifier: Box<dyn Notifier>,
    audit: AuditLog,
    gateway: FilterGateway<SystemNft>,
}

impl Context {
    async fn load(cli: &Cli) -> Result<Self> {
        let config = resolve_config(cli).await?;
        let notifier: Box<dyn Notifier> = match &config.notify_command {
            Some(program) => Box::new(CommandNotifier::new(program)),
            None => Box::new(LogNotifier),
        };
        let audit = AuditLog::in_state_dir().unwrap_or_else(|_| {
            AuditLog::new(config.base_dir.join("logs").join("audit.log"))
        });
        let gateway = FilterGateway::new(SystemNft).with_retry(config.retry.build());
        Ok(Self {
            config,
            notifier,
            audit,
            gateway,
        })
    }

    fn reconciler(&self) -> Reconciler<'_, SystemNft> {
        Reconciler::new(&self.gateway, self.notifier.as_ref()).with_audit(&self.audit)
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::LockPath => {
            println!("{}", resolve_lock_path().display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { force } => init_config(&cli, force).await,
        Commands::Apply { dry_run, seed } => {
            let ctx = Context::load(&cli).await?;
            ctx.gateway.preflight().await?;
            let policy = load_desired(&ctx.config).await?;
            let reconciler = ctx.reconciler().dry_run(dry_run);

            let empty = DesiredPolicy::default();
            let seed_policy = if seed { &policy } else { &empty };
            match reconciler.ensure_baseline(ctx.config.input_policy, seed_policy).await {
                Ok(report) => {
                    for object in &report.created {
                        println!("{} {object}", if dry_run { "would create" } else { "created" });
                    }
                }
                Err(e) => {
                    ctx.notifier.notify(&format!("baseline failed: {e}"));
                    return Err(e);
                }
            }

            let report = reconciler.sync_all(&policy).await;
            for (service, result) in &report.results {
                match result {
                    Ok(Outcome::Added) => println!("added {service}"),
                    Ok(Outcome::WouldAdd) => println!("would add {service}"),
                    Ok(_) => {}
                    Err(e) => eprintln!("failed {e}"),
                }
            }
            println!(
                "{} service(s): {} changed, {} failed",
                report.results.len(),
                report.changed(),
                report.failed()
            );
            Ok(if report.failed() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Generate { print } => {
            let ctx = Context::load(&cli).await?;
            let policy = load_desired(&ctx.config).await?;
            let text = artifact::render(
                policy.ports(Protocol::Tcp),
                policy.ports(Protocol::Udp),
                &ctx.config.render_options(),
            );
            if print {
                print!("{text}");
                return Ok(ExitCode::SUCCESS);
            }

            match artifact::publish(&ctx.config.base_dir, &text, &[]) {
                Ok(published) => {
                    ctx.audit
                        .record(
                            EventType::ArtifactPublished,
                            true,
                            serde_json::json!({
                                "path": published.path,
                                "sha256": published.sha256,
                            }),
                            None,
                        )
                        .await;
                    println!("{} ({})", published.path.display(), published.sha256);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    ctx.audit
                        .record(
                            EventType::ArtifactPublished,
                            false,
                            serde_json::json!({}),
                            Some(e.to_string()),
                        )
                        .await;
                    Err(e)
                }
            }
        }
        Commands::Check => {
            let ctx = Context::load(&cli).await?;
            ctx.gateway.preflight().await?;
            let policy = load_desired(&ctx.config).await?;
            let report = ctx.reconciler().check(ctx.config.input_policy, &policy).await;
            for object in &report.missing_objects {
                println!("missing {object}");
            }
            for service in &report.missing_services {
                println!("missing {service}");
            }
            if report.is_clean() {
                println!("in sync");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Remove {
            port,
            protocol,
            dry_run,
        } => {
            let ctx = Context::load(&cli).await?;
            ctx.gateway.preflight().await?;
            let name = load_desired(&ctx.config)
                .await
                .ok()
                .and_then(|policy| {
                    policy
                        .services()
                        .iter()
                        .find(|s| s.key() == (port, protocol))
                        .map(|s| s.name.clone())
                })
                .unwrap_or_else(|| "manual".to_string());
            let service = Service::new(name, port, protocol);

            match ctx.reconciler().dry_run(dry_run).remove_service(&service).await {
                Ok(Outcome::Removed) => println!("removed {service}"),
                Ok(Outcome::WouldRemove) => println!("would remove {service}"),
                Ok(_) => println!("{service} not present"),
                Err(e) => return Err(e.source),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Flush { yes } => {
            if !yes {
                return Err(Error::Config(
                    "refusing to flush the ruleset without --yes".to_string(),
                ));
            }
            let ctx = Context::load(&cli).await?;
            ctx.gateway.preflight().await?;
            let result = ctx.gateway.flush_ruleset().await;
            ctx.audit
                .record(
                    EventType::FlushRuleset,
                    result.is_ok(),
                    serde_json::json!({}),
                    result.as_ref().err().map(ToString::to_string),
                )
                .await;
            result?;
            info!("Ruleset flushed");
            println!("ruleset flushed");
            Ok(ExitCode::SUCCESS)
        }
    }
}
