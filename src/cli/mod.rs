//! Command-line interface.

mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

pub use self::doctor::run_doctor_command;

use crate::app::{App, resolve_auth_token};
use crate::config::Config;
use crate::launch::LaunchUrlBuilder;
use crate::registry::TrustRegistry;
use crate::settings::{
    CallbackSettings, DatabaseSettings, GatewaySettings, PollerSettings, ProviderSettings,
    RelaySettings, Settings, TrustSettings,
};

#[derive(Parser, Debug)]
#[command(
    name = "stackrelay",
    version,
    about = "Cross-account trust bootstrap and deployment-status relay"
)]
pub struct Cli {
    /// TOML config file. Defaults to ~/.stackrelay/config.toml when present.
    #[arg(long, global = true, env = "STACKRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Validate configuration and probe dependencies.
    #[command(alias = "doctor")]
    CheckConfig {
        /// Exit non-zero if any check fails.
        #[arg(long)]
        strict: bool,
    },
    /// Issue a correlation token for a team and print its launch link.
    LaunchUrl {
        #[arg(long)]
        team: String,
        /// Catalog name or template URL.
        #[arg(long)]
        template: Option<String>,
    },
    /// Write a starter config file and the bootstrap .env.
    InitConfig {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
}

/// Run the selected command.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.config.as_deref()).await,
        Command::CheckConfig { strict } => run_doctor_command(cli.config.as_deref(), strict).await,
        Command::LaunchUrl { team, template } => {
            launch_url(cli.config.as_deref(), &team, template.as_deref()).await
        }
        Command::InitConfig { force } => init_config(cli.config.as_deref(), force),
    }
}

async fn serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(config_path)?;
    let (auth_token, generated) = resolve_auth_token(config.gateway.auth_token.as_deref());

    let app = App::build(config).await?;
    let (addr, state) = app.serve(auth_token.clone()).await?;

    if generated {
        eprintln!("Gateway auth token (set GATEWAY_AUTH_TOKEN to pin it): {auth_token}");
    }
    tracing::info!(
        addr = %addr,
        templates = ?app.launcher.catalog().names().collect::<Vec<_>>(),
        auto_watch = app.config.poller.auto_watch,
        "stackrelay ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    app.shutdown(&state).await;
    Ok(())
}

async fn launch_url(
    config_path: Option<&Path>,
    team_id: &str,
    template: Option<&str>,
) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(config_path)?;
    let store = crate::db::connect_from_config(&config.database).await?;
    let registry = Arc::new(TrustRegistry::new(store, config.trust.token_ttl));
    let launcher = LaunchUrlBuilder::new(registry, &config.provider);

    let template = match template {
        Some(t) => t.to_string(),
        None => launcher
            .catalog()
            .default_name()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("no templates configured"))?,
    };
    let link = launcher.build_launch_url(team_id, &template).await?;

    println!("Stack name: {}", link.stack_name);
    println!("Template:   {}", link.template_url);
    println!();
    println!("{}", link.url);
    Ok(())
}

fn init_config(config_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Settings::default_toml_path);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    let config = Config::from_env_with_toml(None)?;
    let settings = starter_settings(&config);
    settings
        .save_toml(&path)
        .map_err(|e| anyhow::anyhow!(e))?;

    let vars = crate::bootstrap::bootstrap_env_vars_from_settings(&settings);
    let pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
    crate::bootstrap::save_bootstrap_env(&pairs)?;

    println!("Wrote {}", path.display());
    println!(
        "Wrote {}",
        crate::bootstrap::stackrelay_env_path().display()
    );
    Ok(())
}

/// File settings mirroring the currently resolved configuration.
///
/// The database URL is never written; it stays in the environment.
pub fn starter_settings(config: &Config) -> Settings {
    Settings {
        gateway: GatewaySettings {
            host: Some(config.gateway.host.clone()),
            port: Some(config.gateway.port),
            allowed_origins: Some(config.gateway.allowed_origins.clone()),
        },
        database: DatabaseSettings {
            backend: Some(config.database.backend.to_string()),
            url: None,
            pool_size: Some(config.database.pool_size),
            libsql_path: Some(config.database.libsql_path.display().to_string()),
        },
        provider: ProviderSettings {
            region: Some(config.provider.region.clone()),
            console_base_url: Some(config.provider.console_base_url.clone()),
            role_session_name: Some(config.provider.role_session_name.clone()),
            use_team_role: Some(config.provider.use_team_role),
            stack_prefix: Some(config.provider.stack_prefix.clone()),
            templates: Some(config.provider.templates.clone()),
        },
        callback: CallbackSettings {
            ack_allowed_hosts: Some(config.callback.ack_allowed_hosts.clone()),
            ack_timeout_ms: Some(config.callback.ack_timeout.as_millis() as u64),
        },
        trust: TrustSettings {
            token_ttl_secs: config.trust.token_ttl.map(|ttl| ttl.as_secs()),
        },
        relay: RelaySettings {
            connection_buffer: Some(config.relay.connection_buffer),
            max_connections: Some(config.relay.max_connections),
            replay_last_event: Some(config.relay.replay_last_event),
            replay_capacity: Some(config.relay.replay_capacity),
            send_timeout_ms: Some(config.relay.send_timeout.as_millis() as u64),
        },
        poller: PollerSettings {
            auto_watch: Some(config.poller.auto_watch),
            watch_interval_secs: Some(config.poller.watch_interval.as_secs()),
            watch_max_polls: Some(config.poller.watch_max_polls),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["stackrelay"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_parses_launch_url() {
        let cli = Cli::try_parse_from([
            "stackrelay",
            "launch-url",
            "--team",
            "T1",
            "--template",
            "basic",
        ])
        .unwrap();
        match cli.command {
            Some(Command::LaunchUrl { team, template }) => {
                assert_eq!(team, "T1");
                assert_eq!(template.as_deref(), Some("basic"));
            }
            other => panic!("Expected LaunchUrl, got {other:?}"),
        }
    }

    #[test]
    fn doctor_is_an_alias() {
        let cli = Cli::try_parse_from(["stackrelay", "doctor", "--strict"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::CheckConfig { strict: true })
        ));
    }

    #[test]
    fn starter_settings_round_trip_through_config() {
        let config = {
            let _guard = crate::config::ENV_MUTEX
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            Config::build(&Settings::default()).unwrap()
        };
        let settings = starter_settings(&config);
        assert!(settings.database.url.is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        settings.save_toml(&path).unwrap();
        let loaded = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }
}
