use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kecs")]
#[command(about = "ECS-compatible control plane on local Kubernetes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control-plane server (API + admin listeners)
    Server(ServerArgs),

    /// Start an instance, creating its cluster if needed
    Start(StartArgs),

    /// Stop a running instance, keeping its data
    Stop(InstanceArgs),

    /// Destroy an instance's cluster (and optionally its data)
    Destroy(DestroyArgs),

    /// List instances on this host
    List,

    /// Show creation progress for an instance
    Status(InstanceArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port for the ECS-compatible API listener
    #[arg(long, env = "KECS_API_PORT", default_value_t = kecs_common::DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the admin listener (health + websocket hub)
    #[arg(long, env = "KECS_ADMIN_PORT", default_value_t = kecs_common::DEFAULT_ADMIN_PORT)]
    pub admin_port: u16,

    /// Instance this server belongs to; selects the data directory
    #[arg(long, env = "KECS_INSTANCE", default_value = "default")]
    pub instance: String,

    /// Explicit data directory (overrides the instance layout)
    #[arg(long, env = "KECS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Region echoed on every ARN and response
    #[arg(long, env = "KECS_REGION", default_value = kecs_types::DEFAULT_REGION)]
    pub region: String,

    /// Account id echoed on every ARN and response
    #[arg(long, env = "KECS_ACCOUNT_ID", default_value = kecs_types::DEFAULT_ACCOUNT_ID)]
    pub account_id: String,

    /// Fast reconciler timings for test suites
    #[arg(long, env = "KECS_TEST_MODE")]
    pub test_mode: bool,

    /// Run without a Kubernetes cluster attached (storage-only mode)
    #[arg(long)]
    pub no_kubernetes: bool,

    /// Allowed websocket origins; empty accepts all
    #[arg(long)]
    pub allowed_origin: Vec<String>,

    /// LocalStack endpoint for the credential/log adapters
    #[arg(long, env = "KECS_LOCALSTACK_ENDPOINT")]
    pub localstack_endpoint: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct StartArgs {
    /// Instance name; generated when omitted
    #[arg(long)]
    pub instance: Option<String>,

    /// Port for the ECS-compatible API listener
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Port for the admin listener
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Skip deploying the LocalStack emulator
    #[arg(long)]
    pub disable_localstack: bool,

    /// Skip the L7 load-balancer bookkeeping
    #[arg(long)]
    pub disable_elbv2: bool,

    /// Developer mode (verbose component logging)
    #[arg(long)]
    pub dev_mode: bool,

    /// Explicit data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct InstanceArgs {
    /// Instance name
    pub instance: String,
}

#[derive(Parser, Debug, Clone)]
pub struct DestroyArgs {
    /// Instance name
    pub instance: String,

    /// Also remove the instance's data directory
    #[arg(long)]
    pub delete_data: bool,
}
