//! Bootstrap helpers for stackrelay.
//!
//! Bootstrap env vars are persisted to disk so the service can pick its
//! database and provider region before any other configuration loads.
//!
//! File: `~/.stackrelay/.env` (standard dotenvy format)

use std::path::PathBuf;

/// Root directory for local state: `~/.stackrelay`.
pub fn stackrelay_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stackrelay")
}

/// Path to the stackrelay-specific `.env` file: `~/.stackrelay/.env`.
pub fn stackrelay_env_path() -> PathBuf {
    stackrelay_home().join(".env")
}

/// Load env vars from `~/.stackrelay/.env` (in addition to the standard `.env`).
///
/// Call this **after** `dotenvy::dotenv()` so that the standard `./.env`
/// takes priority. dotenvy never overwrites existing env vars, so the
/// effective priority is:
///
///   explicit env vars > `./.env` > `~/.stackrelay/.env`
pub fn load_stackrelay_env() {
    let path = stackrelay_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Write bootstrap vars to `~/.stackrelay/.env`.
///
/// Values are double-quoted so that `#` (common in URL-encoded passwords)
/// survives dotenvy parsing.
pub fn save_bootstrap_env(vars: &[(&str, &str)]) -> std::io::Result<()> {
    save_bootstrap_env_to(&stackrelay_env_path(), vars)
}

pub(crate) fn save_bootstrap_env_to(
    path: &std::path::Path,
    vars: &[(&str, &str)],
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_env_file(vars))
}

fn render_env_file(vars: &[(&str, &str)]) -> String {
    let mut content = String::new();
    for (key, value) in vars {
        // Escape backslashes and double quotes so a value cannot break out
        // of its quotes and inject another variable.
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        content.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    content
}

/// Collect the bootstrap-relevant settings into `(key, value)` pairs.
pub fn bootstrap_env_vars_from_settings(
    settings: &crate::settings::Settings,
) -> Vec<(&'static str, String)> {
    let mut vars = Vec::new();
    push_env_var(
        &mut vars,
        "DATABASE_BACKEND",
        settings.database.backend.as_deref(),
    );
    push_env_var(&mut vars, "DATABASE_URL", settings.database.url.as_deref());
    push_env_var(
        &mut vars,
        "LIBSQL_PATH",
        settings.database.libsql_path.as_deref(),
    );
    push_env_var(&mut vars, "AWS_REGION", settings.provider.region.as_deref());
    vars
}

fn push_env_var(vars: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<&str>) {
    if let Some(value) = value {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            vars.push((key, trimmed.to_string()));
        }
    }
}
