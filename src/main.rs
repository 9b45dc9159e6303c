use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fleetview::{
    ActionKind, FleetApi, FleetClient, FleetEngine, Notification, SelectionState, SortDirection,
    SortKey, SortOrder, VmDetail, VmSummary,
    config::{DEFAULT_CONFIG_FILE, FleetConfig},
    logger,
    vm::DetailSlot,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "fleetview")]
#[command(about = "Live fleet view and lifecycle control for remote virtual machines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the fleetview configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the control-plane base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token for the control plane
    #[arg(long)]
    token: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the fleet once and print it
    #[command(alias = "ls")]
    List(SortArgs),
    /// Show details of one VM
    Show {
        /// VM id
        id: String,
    },
    /// Start a VM
    Start {
        /// VM id
        id: String,
    },
    /// Stop a VM
    Stop {
        /// VM id
        id: String,
    },
    /// Restart a VM
    Restart {
        /// VM id
        id: String,
    },
    /// Keep the fleet view live until interrupted
    Watch {
        /// Poll interval in milliseconds (defaults to the configured one)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Keep this VM selected and show its details
        #[arg(long)]
        select: Option<String>,
        #[command(flatten)]
        sort: SortArgs,
    },
}

#[derive(Args, Clone)]
struct SortArgs {
    /// Sort key
    #[arg(long, value_enum)]
    sort: Option<SortField>,
    /// Sort in descending order
    #[arg(long)]
    desc: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortField {
    Name,
    ObservedAt,
}

impl SortArgs {
    fn resolve(&self, configured: SortOrder) -> SortOrder {
        let key = match self.sort {
            Some(SortField::Name) => SortKey::Name,
            Some(SortField::ObservedAt) => SortKey::ObservedAt,
            None => configured.key,
        };
        let direction = if self.desc {
            SortDirection::Descending
        } else if self.sort.is_some() {
            SortDirection::Ascending
        } else {
            configured.direction
        };
        SortOrder::new(key, direction)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "fleetview=debug");
        }
    }
    logger::init_logger();

    let mut config = match FleetConfig::locate(&cli.config) {
        Some(path) => FleetConfig::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            logger::debug!(
                "No configuration found at {}, using defaults",
                cli.config.display()
            );
            FleetConfig::default()
        }
    };
    if let Some(base_url) = cli.base_url {
        config.api.base_url = base_url;
    }
    if cli.token.is_some() {
        config.api.token = cli.token;
    }
    config.apply_env();
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::List(sort) => {
            let client = FleetClient::new(&config.api)?;
            let mut summaries = client.list_summaries().await?;
            sort.resolve(config.view.sort_order()).apply(&mut summaries);
            print_summaries(&summaries);
        }
        Commands::Show { id } => {
            let client = FleetClient::new(&config.api)?;
            let detail = client.fetch_detail(&id).await?;
            print_detail(&detail);
        }
        Commands::Start { id } => run_action(&config, &id, ActionKind::Start).await?,
        Commands::Stop { id } => run_action(&config, &id, ActionKind::Stop).await?,
        Commands::Restart { id } => run_action(&config, &id, ActionKind::Restart).await?,
        Commands::Watch {
            interval_ms,
            select,
            sort,
        } => {
            if let Some(interval_ms) = interval_ms {
                config.polling.interval_ms = interval_ms;
            }
            let order = sort.resolve(config.view.sort_order());
            config.view.sort_key = order.key;
            config.view.sort_direction = order.direction;
            watch(&config, select).await?;
        }
    }

    Ok(())
}

async fn run_action(config: &FleetConfig, id: &str, kind: ActionKind) -> anyhow::Result<()> {
    let client = FleetClient::new(&config.api)?;
    let engine = FleetEngine::new(
        Arc::new(client),
        config.view.sort_order(),
        config.polling.interval(),
    );

    let wait = Duration::from_millis(config.api.timeout_ms) + Duration::from_secs(1);
    let current = engine
        .dispatch_and_resync(id, kind, wait)
        .await
        .with_context(|| format!("{} on '{}' failed", kind, id))?;
    println!("{} sent to VM '{}'", kind.as_str().to_uppercase(), id);

    match current {
        Some(vm) => println!("Current state: {}", vm.state),
        None => println!("No current state reported for VM '{}'", id),
    }
    Ok(())
}

async fn watch(config: &FleetConfig, select: Option<String>) -> anyhow::Result<()> {
    let engine = FleetEngine::from_config(config)?;
    let mut notifications = engine.subscribe();
    engine.start();

    if let Some(id) = &select {
        engine.select_vm(id).await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            received = notifications.recv() => {
                match received {
                    Ok(Notification::FleetUpdated { .. }) => {
                        print_summaries(&engine.summaries());
                        print_selection(&engine.selection());
                    }
                    Ok(notification) => {
                        if notification.is_failure() {
                            eprintln!("! {}", notification);
                        } else {
                            println!("* {}", notification);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        logger::debug!("Notification stream lagged by {}", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    engine.shutdown();
    Ok(())
}

fn print_summaries(summaries: &[VmSummary]) {
    println!(
        "{:<38} {:<24} {:<10} {:<6} {:<10} {:<20}",
        "ID", "NAME", "STATE", "CPU", "MEMORY", "OBSERVED"
    );
    println!("{}", "=".repeat(112));

    for vm in summaries {
        println!(
            "{:<38} {:<24} {:<10} {:<6} {:<10} {:<20}",
            vm.id,
            vm.display_name(),
            vm.state.as_str(),
            vm.cpu_allocation,
            format!("{}MB", vm.memory_mb),
            vm.observed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if summaries.is_empty() {
        println!("No VMs reported by the control plane");
    }
}

fn print_selection(selection: &SelectionState) {
    match selection {
        SelectionState::None => {}
        SelectionState::Selected { id, detail } => match detail {
            DetailSlot::Pending => println!("\nLoading details for '{}'...", id),
            DetailSlot::Failed(reason) => println!("\nDetails for '{}' unavailable: {}", id, reason),
            DetailSlot::Loaded(detail) => {
                println!();
                print_detail(detail);
            }
        },
    }
}

fn print_detail(detail: &VmDetail) {
    let vm = &detail.summary;
    println!("VM: {} ({})", vm.display_name(), vm.id);
    println!("  State:    {}", vm.state);
    println!("  CPU:      {}", vm.cpu_allocation);
    println!("  Memory:   {}MB", vm.memory_mb);
    println!("  Observed: {}", vm.observed_at.to_rfc3339());

    if !detail.disks.is_empty() {
        println!("  Disks:");
        for disk in &detail.disks {
            println!("    {:<8} {}", disk.device, disk.path);
        }
    }

    if !detail.interfaces.is_empty() {
        println!("  Interfaces:");
        for iface in &detail.interfaces {
            let addresses: Vec<&str> = iface.addresses.iter().map(String::as_str).collect();
            println!(
                "    {:<8} {:<18} {}",
                iface.name,
                iface.mac.as_deref().unwrap_or("-"),
                if addresses.is_empty() {
                    "-".to_string()
                } else {
                    addresses.join(", ")
                }
            );
        }
    }

    if !detail.metadata.is_empty() {
        println!("  Metadata:");
        for (key, value) in &detail.metadata {
            println!("    {} = {}", key, value);
        }
    }
}
