use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use farm_protocol::{
    AdbBackend, BusStore, DeviceBackend, DeviceSession, LocalBackend, SessionConfig,
    DEFAULT_GLOBAL_CHANNEL,
};
use farm_provider::config::parse_size;
use farm_provider::{
    wait_for_shutdown_signal, BackendKind, CommandDiscovery, MuteMaster, ProcessLauncher,
    ProviderConfig, ProviderError, Supervisor, WorkerConfig, WorkerPolicy, WorkerSettings,
};
use farm_transport::{BusConfig, BusEndpoint, BusHub, Publisher};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "farm-provider", about = "Device farm provider and workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise the devices attached to this host.
    Provider(ProviderArgs),

    /// Run the session for one device (started by the provider).
    Device {
        /// Worker configuration as JSON.
        #[arg(long)]
        config: String,
    },

    /// Forward pushed messages to subscribers.
    Hub {
        /// Address subscribers connect to.
        #[arg(long, env = "FARM_HUB_BIND_PUB", default_value = "127.0.0.1:7114")]
        bind_pub: String,
        /// Address publishers push to.
        #[arg(long, env = "FARM_HUB_BIND_PULL", default_value = "127.0.0.1:7116")]
        bind_pull: String,
    },
}

#[derive(clap::Args)]
struct ProviderArgs {
    /// Name of this provider.
    #[arg(long, env = "FARM_PROVIDER_NAME", default_value_t = default_name())]
    name: String,

    /// Lowest port handed to workers.
    #[arg(long, env = "FARM_PROVIDER_MIN_PORT", default_value = "7700")]
    min_port: u16,

    /// Highest port handed to workers.
    #[arg(long, env = "FARM_PROVIDER_MAX_PORT", default_value = "7900")]
    max_port: u16,

    /// Only manage these serials (repeatable). Default: all.
    #[arg(long = "serial", env = "FARM_PROVIDER_SERIAL", value_delimiter = ',')]
    serials: Vec<String>,

    /// Bus endpoints to subscribe to (repeatable).
    #[arg(long, env = "FARM_PROVIDER_CONNECT_SUB", value_delimiter = ',', required = true)]
    connect_sub: Vec<String>,

    /// Bus endpoints to push to (repeatable).
    #[arg(long, env = "FARM_PROVIDER_CONNECT_PUSH", value_delimiter = ',', required = true)]
    connect_push: Vec<String>,

    /// How workers reach their device.
    #[arg(long, env = "FARM_PROVIDER_BACKEND", value_enum, default_value = "adb")]
    backend: BackendKind,

    #[arg(long, env = "FARM_PROVIDER_ADB_HOST", default_value = "127.0.0.1")]
    adb_host: String,

    #[arg(long, env = "FARM_PROVIDER_ADB_PORT", default_value = "5037")]
    adb_port: u16,

    /// Address clients use to reach this host.
    #[arg(long, env = "FARM_PROVIDER_PUBLIC_IP", default_value = "localhost")]
    public_ip: String,

    /// Group membership timeout, seconds.
    #[arg(long, env = "FARM_PROVIDER_GROUP_TIMEOUT", default_value = "900")]
    group_timeout: u64,

    /// Device heartbeat interval, ms.
    #[arg(
        long,
        env = "FARM_PROVIDER_HEARTBEAT_INTERVAL",
        default_value = "10000",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    heartbeat_interval: u64,

    /// How long to wait for a device to boot, ms.
    #[arg(long, env = "FARM_PROVIDER_BOOT_COMPLETE_TIMEOUT", default_value = "60000")]
    boot_complete_timeout: u64,

    #[arg(long, env = "FARM_PROVIDER_SCREEN_JPEG_QUALITY", default_value = "80")]
    screen_jpeg_quality: u8,

    /// Screen stream ping interval, ms.
    #[arg(long, env = "FARM_PROVIDER_SCREEN_PING_INTERVAL", default_value = "30000")]
    screen_ping_interval: u64,

    #[arg(
        long,
        env = "FARM_PROVIDER_SCREEN_WS_URL_PATTERN",
        default_value = "ws://${publicIp}:${publicPort}"
    )]
    screen_ws_url_pattern: String,

    #[arg(
        long,
        env = "FARM_PROVIDER_CONNECT_URL_PATTERN",
        default_value = "${publicIp}:${publicPort}"
    )]
    connect_url_pattern: String,

    /// Initial VNC size, WIDTHxHEIGHT.
    #[arg(long, env = "FARM_PROVIDER_VNC_INITIAL_SIZE", default_value = "600x800", value_parser = parse_size)]
    vnc_initial_size: (u32, u32),

    #[arg(long, env = "FARM_PROVIDER_MUTE_MASTER", value_enum, default_value = "never")]
    mute_master: MuteMaster,

    #[arg(long, env = "FARM_PROVIDER_STORAGE_URL")]
    storage_url: Option<String>,

    /// Allow remote debugging connections.
    #[arg(long, env = "FARM_PROVIDER_ALLOW_REMOTE")]
    allow_remote: bool,

    /// Lock rotation while a device is in use.
    #[arg(long, env = "FARM_PROVIDER_LOCK_ROTATION")]
    lock_rotation: bool,

    /// Skip cleanup when a device is released.
    #[arg(long, env = "FARM_PROVIDER_NO_CLEANUP")]
    no_cleanup: bool,

    /// Skip the screen reset when a device is released.
    #[arg(long, env = "FARM_PROVIDER_NO_SCREEN_RESET")]
    no_screen_reset: bool,

    /// Grace period before a stopping worker is killed, ms.
    #[arg(long, env = "FARM_PROVIDER_KILL_TIMEOUT", default_value = "10000")]
    kill_timeout: u64,

    /// Listing command polled for devices. Default: `adb -H <adb-host> -P <adb-port> devices`.
    #[arg(long, env = "FARM_PROVIDER_DISCOVERY_COMMAND")]
    discovery_command: Option<String>,

    /// Discovery poll interval, ms.
    #[arg(
        long,
        env = "FARM_PROVIDER_DISCOVERY_INTERVAL",
        default_value = "5000",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    discovery_interval: u64,
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "provider".to_string())
}

impl ProviderArgs {
    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            public_ip: self.public_ip.clone(),
            connect_sub: self.connect_sub.clone(),
            connect_push: self.connect_push.clone(),
            backend: self.backend,
            adb_host: self.adb_host.clone(),
            adb_port: self.adb_port,
            heartbeat_interval_ms: self.heartbeat_interval,
            boot_complete_timeout_ms: self.boot_complete_timeout,
            group_timeout_secs: self.group_timeout,
            screen_jpeg_quality: self.screen_jpeg_quality,
            screen_ping_interval_ms: self.screen_ping_interval,
            screen_ws_url_pattern: self.screen_ws_url_pattern.clone(),
            connect_url_pattern: self.connect_url_pattern.clone(),
            vnc_initial_size: self.vnc_initial_size,
            mute_master: self.mute_master,
            storage_url: self.storage_url.clone(),
            policy: WorkerPolicy {
                allow_remote: self.allow_remote,
                cleanup: !self.no_cleanup,
                lock_rotation: self.lock_rotation,
                screen_reset: !self.no_screen_reset,
            },
        }
    }

    fn discovery(&self) -> Result<CommandDiscovery, ProviderError> {
        let command = match &self.discovery_command {
            Some(cmd) => cmd.split_whitespace().map(String::from).collect(),
            None => vec![
                "adb".to_string(),
                "-H".to_string(),
                self.adb_host.clone(),
                "-P".to_string(),
                self.adb_port.to_string(),
                "devices".to_string(),
            ],
        };
        CommandDiscovery::new(command, Duration::from_millis(self.discovery_interval))
    }
}

fn bus_config(sub: &[String], push: &[String]) -> BusConfig {
    BusConfig::new()
        .sub_endpoints(sub.to_vec())
        .push_endpoints(push.to_vec())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Provider(args) => run_provider(args).await,
        Command::Device { config } => run_device(&config).await,
        Command::Hub {
            bind_pub,
            bind_pull,
        } => run_hub(&bind_pub, &bind_pull).await,
    }
}

async fn run_provider(args: ProviderArgs) -> anyhow::Result<()> {
    let config = ProviderConfig::new(args.name.clone())
        .serials(args.serials.clone())
        .port_range(args.min_port, args.max_port)
        .kill_timeout(Duration::from_millis(args.kill_timeout))
        .worker(args.worker_settings());

    let publisher = Publisher::connect(&bus_config(&args.connect_sub, &args.connect_push))
        .await
        .context("cannot reach any push endpoint")?;
    let store = Arc::new(BusStore::new(publisher, DEFAULT_GLOBAL_CHANNEL));
    let launcher = Arc::new(ProcessLauncher::current_exe()?);

    let discovery = args.discovery()?;
    let supervisor = Supervisor::new(config, launcher, store)?;
    let (feed, _discovery) = discovery.spawn();
    let (handle, mut task) = supervisor.spawn(feed);

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal.context("installing signal handlers")?;
            handle.shutdown().await?;
            task.await?;
        }
        result = &mut task => {
            result?;
            anyhow::bail!("supervisor stopped unexpectedly");
        }
    }
    Ok(())
}

async fn run_device(json: &str) -> anyhow::Result<()> {
    let config = WorkerConfig::from_json(json).context("invalid worker configuration")?;
    let span = tracing::info_span!("device", serial = %config.serial);

    async move {
        let settings = &config.settings;
        tracing::info!(
            provider = %config.provider,
            connect_url = %config.connect_url(),
            screen_url = %config.screen_ws_url(),
            "starting worker"
        );

        let bus = BusEndpoint::connect(bus_config(&settings.connect_sub, &settings.connect_push))
            .await
            .context("cannot reach the bus")?;
        let store = Arc::new(BusStore::new(bus.publisher(), DEFAULT_GLOBAL_CHANNEL));

        let backend: Arc<dyn DeviceBackend> = match settings.backend {
            BackendKind::Adb => Arc::new(AdbBackend::new(settings.adb_host.clone(), settings.adb_port)),
            BackendKind::Local => Arc::new(
                LocalBackend::default()
                    .property("platform", "Local")
                    .property("ro.product.model", config.serial.clone()),
            ),
        };

        let session_config = SessionConfig::new(config.serial.clone())
            .heartbeat_interval(Duration::from_millis(settings.heartbeat_interval_ms));

        DeviceSession::new(session_config, backend)
            .with_store(store)
            .run(bus, async {
                if let Err(e) = wait_for_shutdown_signal().await {
                    tracing::error!("cannot install signal handlers: {e}");
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        tracing::info!("bye");
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

async fn run_hub(bind_pub: &str, bind_pull: &str) -> anyhow::Result<()> {
    let mut hub = BusHub::bind(bind_pub, bind_pull).await?;
    wait_for_shutdown_signal().await?;
    hub.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(extra: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec![
            "farm-provider",
            "provider",
            "--connect-sub",
            "tcp://127.0.0.1:7114",
            "--connect-push",
            "tcp://127.0.0.1:7116",
        ];
        argv.extend_from_slice(extra);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn defaults_parse() {
        assert!(provider(&[]).is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(provider(&["--discovery-interval", "0"]).is_err());
        assert!(provider(&["--heartbeat-interval", "0"]).is_err());
        assert!(provider(&["--discovery-interval", "1", "--heartbeat-interval", "1"]).is_ok());
    }
}
