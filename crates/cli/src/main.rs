// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - CLI Client
// Command-line interface for the tunnel registry daemon

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use reqwest::Client;

use tunnel_registry_common::{
    CreateTunnelRequest, DaemonClientConfig, EventListener, Protocol, ReconcileReport, TunnelEntry,
    TunnelEvent,
};

#[derive(Parser)]
#[command(name = "tunnelctl")]
#[command(about = "Tunnel Registry CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Open a new tunnel
    Create {
        /// Tunnel protocol (http or tcp)
        protocol: Protocol,

        /// Local address to forward to, e.g. localhost:8080
        forwards_to: String,

        /// Reserved domain (or reserved TCP address)
        #[arg(short, long)]
        domain: Option<String>,

        /// Free-form label stored with the tunnel
        #[arg(short, long)]
        metadata: Option<String>,
    },

    /// Delete a tunnel by URL or unique URL fragment
    Delete {
        /// Public URL or a substring of it
        url: String,

        /// Only match the full URL
        #[arg(long)]
        exact: bool,
    },

    /// Retry restoring tunnels that are not live
    Reconcile,

    /// Check whether the daemon is reachable
    Health,

    /// Stream registry events
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::CliConfig::load()?.daemon_config;
    let client = tunnel_registry_common::create_daemon_client()?;

    match cli.command {
        Commands::List { json } => list_tunnels(&client, &config, json).await,
        Commands::Create {
            protocol,
            forwards_to,
            domain,
            metadata,
        } => {
            let request = CreateTunnelRequest {
                protocol,
                forwards_to,
                domain,
                metadata,
            };
            create_tunnel(&client, &config, request).await
        }
        Commands::Delete { url, exact } => delete_tunnel(&client, &config, &url, exact).await,
        Commands::Reconcile => reconcile(&client, &config).await,
        Commands::Health => health(&client, &config).await,
        Commands::Watch => watch_events(config).await,
    }
}

async fn list_tunnels(client: &Client, config: &DaemonClientConfig, json: bool) -> Result<()> {
    let tunnels = tunnel_registry_common::list_tunnels(client, config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tunnels)?);
        return Ok(());
    }

    if tunnels.is_empty() {
        println!("{}", "No tunnels registered.".yellow());
        println!(
            "Create one with: {}",
            "tunnelctl create http localhost:8080".cyan()
        );
        return Ok(());
    }

    println!();
    println!("{}", tunnel_table(&tunnels));
    println!();
    println!("{} tunnel(s) registered", tunnels.len().to_string().cyan());
    println!();
    Ok(())
}

fn tunnel_table(tunnels: &[TunnelEntry]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(
        ["URL", "Protocol", "Forwards To", "Domain", "Metadata"]
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan)),
    );

    for tunnel in tunnels {
        let d = &tunnel.descriptor;
        table.add_row(vec![
            Cell::new(&tunnel.url).fg(Color::Green),
            Cell::new(d.protocol),
            Cell::new(&d.forwards_to),
            Cell::new(d.domain.as_deref().unwrap_or("-")),
            Cell::new(d.metadata.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }

    table
}

async fn create_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    request: CreateTunnelRequest,
) -> Result<()> {
    // Fail fast on obviously bad input; the daemon validates again
    request.validate()?;

    let entry = tunnel_registry_common::create_tunnel(client, config, &request)
        .await
        .context("Failed to create tunnel")?;

    println!(
        "{} {} {} {}",
        "✓".green(),
        entry.url.bold(),
        "→".dimmed(),
        entry.descriptor.forwards_to
    );
    Ok(())
}

async fn delete_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    query: &str,
    exact: bool,
) -> Result<()> {
    let response = tunnel_registry_common::delete_tunnel(client, config, query, exact).await?;
    println!("{} {}", "✓".green(), response.message);
    Ok(())
}

async fn reconcile(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    let report = tunnel_registry_common::reconcile(client, config).await?;
    print_report(&report);

    if !report.is_clean() {
        anyhow::bail!("{} tunnel(s) could not be restored", report.failed.len());
    }
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    for url in &report.unchanged {
        println!("{} {}", "restored".green(), url);
    }
    for migration in &report.migrated {
        println!(
            "{} {} {} {}",
            "migrated".yellow(),
            migration.from.dimmed(),
            "→".dimmed(),
            migration.to
        );
    }
    for url in &report.skipped {
        println!("{} {}", "live".cyan(), url);
    }
    for failure in &report.failed {
        eprintln!("{} {}: {}", "failed".red(), failure.url, failure.error);
    }
    println!(
        "{}",
        format!("Reconciled {} tunnel(s)", report.total()).dimmed()
    );
}

async fn health(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    tunnel_registry_common::health(client, config).await?;
    println!(
        "{} Daemon is running at {}",
        "✓".green(),
        config.daemon_url
    );
    Ok(())
}

async fn watch_events(config: DaemonClientConfig) -> Result<()> {
    let mut events = EventListener::new(config).listen().await?;

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    while let Some(event) = events.recv().await {
        if let Some(line) = describe_event(&event) {
            println!("{}", line);
        }
    }

    Ok(())
}

fn describe_event(event: &TunnelEvent) -> Option<String> {
    let line = match event {
        TunnelEvent::Created { entry } => format!(
            "Created {} → {}",
            entry.url, entry.descriptor.forwards_to
        )
        .green()
        .to_string(),
        TunnelEvent::Deleted { url } => format!("Deleted {}", url).yellow().to_string(),
        TunnelEvent::Migrated { from, to } => format!("Migrated {} → {}", from, to).cyan().to_string(),
        TunnelEvent::ReconcileFailed { url, error } => {
            format!("Failed to restore {}: {}", url, error).red().to_string()
        }
        TunnelEvent::Heartbeat { .. } => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_registry_common::{TunnelDescriptor, Utc};

    #[test]
    fn test_parse_create_command() {
        let cli = Cli::try_parse_from([
            "tunnelctl",
            "create",
            "tcp",
            "localhost:22",
            "--domain",
            "1.tcp.example.com:20000",
        ])
        .unwrap();

        match cli.command {
            Commands::Create {
                protocol,
                forwards_to,
                domain,
                metadata,
            } => {
                assert_eq!(protocol, Protocol::Tcp);
                assert_eq!(forwards_to, "localhost:22");
                assert_eq!(domain.as_deref(), Some("1.tcp.example.com:20000"));
                assert!(metadata.is_none());
            }
            _ => panic!("expected create command"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        assert!(Cli::try_parse_from(["tunnelctl", "create", "udp", "localhost:53"]).is_err());
    }

    #[test]
    fn test_parse_delete_exact() {
        let cli = Cli::try_parse_from(["tunnelctl", "delete", "abc", "--exact"]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { exact: true, .. }));
    }

    #[test]
    fn test_table_lists_every_tunnel() {
        let tunnels = vec![
            TunnelEntry {
                url: "https://abc.example.com".to_string(),
                descriptor: TunnelDescriptor::new(Protocol::Http, "localhost:8080"),
            },
            TunnelEntry {
                url: "tcp://0.tcp.example.com:1".to_string(),
                descriptor: TunnelDescriptor::new(Protocol::Tcp, "localhost:22")
                    .with_metadata("ssh"),
            },
        ];

        let rendered = tunnel_table(&tunnels).to_string();

        assert!(rendered.contains("https://abc.example.com"));
        assert!(rendered.contains("localhost:22"));
        assert!(rendered.contains("ssh"));
    }

    #[test]
    fn test_heartbeats_are_not_printed() {
        assert!(describe_event(&TunnelEvent::Heartbeat {
            timestamp: Utc::now()
        })
        .is_none());
        assert!(describe_event(&TunnelEvent::Deleted {
            url: "https://abc.example.com".to_string()
        })
        .unwrap()
        .contains("abc.example.com"));
    }
}
