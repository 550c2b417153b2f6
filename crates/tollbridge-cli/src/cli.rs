use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tollbridge")]
#[command(about = "Tollbridge CLI - obtain cluster credentials")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Authenticate and print an ExecCredential
    Login(LoginArgs),
}

#[derive(clap::Args)]
pub struct LoginArgs {
    #[command(subcommand)]
    pub command: LoginCommands,
}

#[derive(Subcommand)]
pub enum LoginCommands {
    /// Login using a static token
    Static(StaticLoginArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct StaticLoginArgs {
    /// Static token to present during login
    #[arg(long)]
    pub token: Option<String>,
    /// Environment variable containing a static token
    #[arg(long)]
    pub token_env: Option<String>,
    /// Exchange the token with the concierge during login
    #[arg(long)]
    pub enable_concierge: bool,
    /// Namespace in which the concierge was installed
    #[arg(long, default_value = "tollbridge-concierge")]
    pub concierge_namespace: String,
    /// Concierge authenticator type (e.g. 'webhook', 'jwt')
    #[arg(long, default_value = "")]
    pub concierge_authenticator_type: String,
    /// Concierge authenticator name
    #[arg(long, default_value = "")]
    pub concierge_authenticator_name: String,
    /// API base for the concierge endpoint
    #[arg(long, default_value = "")]
    pub concierge_endpoint: String,
    /// Base64 encoded CA bundle to use when connecting to the concierge
    #[arg(long, default_value = "")]
    pub concierge_ca_bundle_data: String,
    /// Concierge API group suffix
    #[arg(long, default_value = "tollbridge.dev")]
    pub concierge_api_group_suffix: String,
    /// Whether the concierge cluster uses an impersonation proxy
    #[arg(long)]
    pub concierge_use_impersonation_proxy: bool,
}
