//! `kernelmesh` - run code through a tree of composable kernels
//!
//! The binary wires a handful of demo kernels into a composite, optionally
//! reached through a proxy and an in-process kernel host, and prints the
//! events each submission produces.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use kernelmesh_core::contract::{EventPayload, KernelInfo};
use kernelmesh_core::kernel::{CompositeKernel, Kernel, KernelCommandResult, KernelHost};
use kernelmesh_core::transport::{stream, Connector};
use kernelmesh_core::{KernelCommand, KernelUri, MeshConfig, WireCodec};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConfigCommand};

mod cli;
mod kernels;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.version {
        let blue = Style::new().blue();
        println!(
            "{} v{} ({})",
            blue.apply_to("kernelmesh"),
            env!("CARGO_PKG_VERSION"),
            env!("GIT_HASH")
        );
        return Ok(ExitCode::SUCCESS);
    }

    let config = match &cli.config {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => MeshConfig::load_or_default(),
    };
    init_logging(&config, cli.verbose);

    match cli.command {
        Some(Commands::Submit {
            code,
            target,
            remote,
            slips,
        }) => handle_submit(&config, code.join(" "), target, remote, slips).await,
        Some(Commands::Info { remote, json }) => handle_info(&config, remote, json).await,
        Some(Commands::Serve { host_uri }) => handle_serve(&config, &host_uri).await,
        Some(Commands::Config { cmd }) => handle_config(&cli.config, &config, cmd),
        None => {
            let dim = Style::new().dim();
            println!("{}", dim.apply_to("No command given. Try `kernelmesh --help`."));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr; stdout carries results, or the wire protocol when serving
fn init_logging(config: &MeshConfig, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Demo composite, local or behind a proxy. Hosts are kept alive by the caller.
async fn build_composite(config: &MeshConfig, remote: bool) -> Result<(Arc<CompositeKernel>, Vec<KernelHost>)> {
    if remote {
        kernels::remote_demo_composite(config).await
    } else {
        Ok((kernels::demo_composite(config)?, Vec::new()))
    }
}

async fn handle_submit(
    config: &MeshConfig,
    code: String,
    target: Option<String>,
    remote: bool,
    slips: bool,
) -> Result<ExitCode> {
    let (composite, _hosts) = build_composite(config, remote).await?;

    let mut command = KernelCommand::submit_code(code);
    if let Some(target) = target {
        command = command.with_target(target);
    }
    let result = composite.send(command).await?;

    print_result(&result, slips);
    if result.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_result(result: &KernelCommandResult, slips: bool) {
    let red = Style::new().red();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();

    if slips {
        println!("{} {}", dim.apply_to("command:"), result.command.routing_slip);
    }
    for event in &result.events {
        match &event.payload {
            EventPayload::ReturnValueProduced(value) => {
                for formatted in &value.formatted_values {
                    println!("{}", formatted.value);
                }
            }
            EventPayload::DisplayedValueProduced(value) => {
                for formatted in &value.formatted_values {
                    println!("{}", formatted.value);
                }
            }
            EventPayload::StandardOutputValueProduced(value) => {
                for formatted in &value.formatted_values {
                    print!("{}", formatted.value);
                    if !formatted.value.ends_with('\n') {
                        println!();
                    }
                }
            }
            EventPayload::DiagnosticsProduced(produced) => {
                for diagnostic in &produced.diagnostics {
                    eprintln!(
                        "{} {}: {}",
                        yellow.apply_to(format!("{:?}", diagnostic.severity).to_lowercase()),
                        diagnostic.code,
                        diagnostic.message
                    );
                }
            }
            _ => {}
        }
        if slips {
            println!(
                "{} {} {}",
                dim.apply_to("  event:"),
                event.event_type(),
                event.routing_slip
            );
        }
    }

    if let Some(message) = result.failure_message() {
        eprintln!("{} {}", red.apply_to("error:"), message);
    }
}

async fn handle_info(config: &MeshConfig, remote: bool, json: bool) -> Result<ExitCode> {
    let (composite, _hosts) = build_composite(config, remote).await?;

    let result = composite.send(KernelCommand::request_kernel_info()).await?;
    let infos: Vec<KernelInfo> = result
        .events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::KernelInfoProduced(produced) => Some(produced.kernel_info.clone()),
            _ => None,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(ExitCode::SUCCESS);
    }

    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for info in &infos {
        let language = info.language_name.as_deref().unwrap_or("-");
        println!("{} {}", bold.apply_to(&info.local_name), dim.apply_to(language));
        println!("  uri: {}", info.uri);
        if let Some(remote_uri) = &info.remote_uri {
            println!("  remote: {}", remote_uri);
        }
        if !info.aliases.is_empty() {
            println!("  aliases: {}", info.aliases.join(", "));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_serve(config: &MeshConfig, host_uri: &str) -> Result<ExitCode> {
    let uri = KernelUri::parse(host_uri).context("Invalid host uri")?;
    let codec = Arc::new(WireCodec::new());
    let connector = Connector::new(stream::stdio(Arc::clone(&codec)), codec, &config.transport);
    let mut inbound = connector.subscribe();

    let composite = kernels::demo_composite(config)?;
    let host = KernelHost::new(composite, Arc::clone(&connector), uri)?;
    host.connect().await?;
    info!(uri = %host.uri(), "serving kernels on stdio");

    // the subscription closes once stdin reaches end of file
    let wait_for_disconnect = async {
        loop {
            if let Err(tokio::sync::broadcast::error::RecvError::Closed) = inbound.recv().await {
                break;
            }
        }
    };
    tokio::select! {
        _ = wait_for_disconnect => info!("client disconnected"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    host.composite().cancel();
    connector.close().await.ok();
    Ok(ExitCode::SUCCESS)
}

fn handle_config(
    explicit_path: &Option<std::path::PathBuf>,
    config: &MeshConfig,
    cmd: Option<ConfigCommand>,
) -> Result<ExitCode> {
    let path = match explicit_path {
        Some(path) => Some(path.clone()),
        None => MeshConfig::default_path(),
    };

    match cmd.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommand::Path => match path {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("No configuration directory on this platform"),
        },
        ConfigCommand::Init { force } => {
            let path = path.context("No configuration directory on this platform")?;
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            MeshConfig::default().save(&path)?;
            let green = Style::new().green();
            println!("{} {}", green.apply_to("Wrote"), path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
