//! `stackrelay check-config` - active health diagnostics.
//!
//! Resolves configuration the same way `serve` does, then probes the trust
//! store, the listen port and provider credentials. Each check reports
//! pass/fail with guidance on failures.

use std::path::Path;
use std::time::Duration;

use crate::config::{Config, DatabaseBackend};

/// Run diagnostic checks and print results.
pub async fn run_doctor_command(config_path: Option<&Path>, strict: bool) -> anyhow::Result<()> {
    println!("stackrelay check-config");
    println!("=======================\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    let config = match Config::from_env_with_toml(config_path) {
        Ok(config) => {
            check(
                "Configuration",
                CheckResult::Pass("resolved from environment and config file".into()),
                &mut passed,
                &mut failed,
            );
            config
        }
        Err(e) => {
            check(
                "Configuration",
                CheckResult::Fail(e.to_string()),
                &mut passed,
                &mut failed,
            );
            return finish(passed, failed, strict);
        }
    };

    check(
        "Trust store",
        check_database(&config).await,
        &mut passed,
        &mut failed,
    );

    check(
        "Gateway bind port",
        check_gateway_port_available(&config),
        &mut passed,
        &mut failed,
    );

    check(
        "Gateway auth token",
        check_auth_token(&config),
        &mut passed,
        &mut failed,
    );

    check(
        "Relay origins",
        check_allowed_origins(&config),
        &mut passed,
        &mut failed,
    );

    check(
        "Template catalog",
        check_templates(&config),
        &mut passed,
        &mut failed,
    );

    check(
        "Callback acknowledgement hosts",
        check_ack_hosts(&config),
        &mut passed,
        &mut failed,
    );

    check(
        "Provider credentials",
        check_provider_credentials(&config).await,
        &mut passed,
        &mut failed,
    );

    finish(passed, failed, strict)
}

fn finish(passed: u32, failed: u32, strict: bool) -> anyhow::Result<()> {
    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 {
        println!("\n  Some checks failed. This is normal if you don't use those features.");
        if strict {
            anyhow::bail!("check-config strict mode failed with {failed} check(s)");
        }
    }

    Ok(())
}

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

#[derive(Debug)]
enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

// ── Individual checks ───────────────────────────────────────

async fn check_database(config: &Config) -> CheckResult {
    let backend = config.database.backend;
    match tokio::time::timeout(
        Duration::from_secs(10),
        crate::db::connect_from_config(&config.database),
    )
    .await
    {
        Ok(Ok(_)) => match backend {
            DatabaseBackend::LibSql => CheckResult::Pass(format!(
                "libSQL database ready ({})",
                config.database.libsql_path.display()
            )),
            other => CheckResult::Pass(format!("{other} connected, migrations applied")),
        },
        Ok(Err(e)) => CheckResult::Fail(format!("{backend} unavailable: {e}")),
        Err(_) => CheckResult::Fail(format!("{backend} connection timed out after 10s")),
    }
}

fn check_gateway_port_available(config: &Config) -> CheckResult {
    let bind_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    match std::net::TcpListener::bind(&bind_addr) {
        Ok(listener) => {
            drop(listener);
            CheckResult::Pass(format!("{bind_addr} is available"))
        }
        Err(error) => CheckResult::Fail(format!(
            "{bind_addr} is unavailable ({error}); free the port or change GATEWAY_PORT"
        )),
    }
}

fn check_auth_token(config: &Config) -> CheckResult {
    match config.gateway.auth_token.as_deref() {
        Some(token) if token.len() >= 32 => CheckResult::Pass("configured".into()),
        Some(_) => CheckResult::Fail(
            "GATEWAY_AUTH_TOKEN is shorter than 32 characters; use a longer random value".into(),
        ),
        None => CheckResult::Skip(
            "GATEWAY_AUTH_TOKEN not set; a random token is generated at each start".into(),
        ),
    }
}

fn check_allowed_origins(config: &Config) -> CheckResult {
    if config.gateway.allowed_origins.is_empty() {
        CheckResult::Pass("loopback origins only (set GATEWAY_ALLOWED_ORIGINS for a portal)".into())
    } else {
        CheckResult::Pass(config.gateway.allowed_origins.join(", "))
    }
}

fn check_templates(config: &Config) -> CheckResult {
    let templates = &config.provider.templates;
    if templates.is_empty() {
        return CheckResult::Fail("no templates configured; set TEMPLATE_CATALOG".into());
    }
    let names: Vec<&str> = templates.keys().map(String::as_str).collect();
    CheckResult::Pass(format!("{} template(s): {}", names.len(), names.join(", ")))
}

fn check_ack_hosts(config: &Config) -> CheckResult {
    let hosts = &config.callback.ack_allowed_hosts;
    if hosts.is_empty() {
        return CheckResult::Fail(
            "no hosts allowed; provisioning callbacks will never be acknowledged".into(),
        );
    }
    CheckResult::Pass(hosts.join(", "))
}

#[cfg(feature = "aws")]
async fn check_provider_credentials(config: &Config) -> CheckResult {
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.provider.region.clone()))
        .load()
        .await;
    if sdk_config.credentials_provider().is_none() {
        return CheckResult::Fail("no AWS credentials found in the environment".into());
    }

    let sts = aws_sdk_sts::Client::new(&sdk_config);
    match tokio::time::timeout(Duration::from_secs(10), sts.get_caller_identity().send()).await {
        Ok(Ok(identity)) => CheckResult::Pass(format!(
            "account {} in {}",
            identity.account().unwrap_or("unknown"),
            config.provider.region
        )),
        Ok(Err(e)) => CheckResult::Fail(format!(
            "credential check failed: {}",
            aws_sdk_sts::error::DisplayErrorContext(&e)
        )),
        Err(_) => CheckResult::Fail("STS did not answer within 10s".into()),
    }
}

#[cfg(not(feature = "aws"))]
async fn check_provider_credentials(_config: &Config) -> CheckResult {
    CheckResult::Skip("built without the aws feature".into())
}
