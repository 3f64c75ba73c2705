use platform::PlatformError;
use regex::Regex;
use shared_types::AppConfig;
use std::env;
use std::fs;
use std::path::Path;

/// Load a single TOML config file, interpolating `{{VAR}}` or `${VAR}`
/// occurrences from the environment. Unresolved variables are left
/// untouched so the TOML parse error points at them.
pub fn load_single_config(path: &Path) -> Result<AppConfig, PlatformError> {
    let content = fs::read_to_string(path)
        .map_err(|e| PlatformError::Config(format!("read {}: {e}", path.display())))?;

    let interpolated = interpolate_env(&content);

    toml::from_str(&interpolated)
        .map_err(|e| PlatformError::Config(format!("parse {}: {e}", path.display())))
}

fn interpolate_env(content: &str) -> String {
    let re = Regex::new(r"(\{\{|\$\{)([a-zA-Z0-9_]+)(\}\}|\})").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[2];
        env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Merge an environment overlay onto the base configuration:
/// - providers merge by id (an overlay entry replaces the same-id base
///   entry; new ids are appended),
/// - `redis` is replaced when the overlay sets it,
/// - `pipeline` and `circuit_breaker` are replaced wholesale when the
///   overlay file declares those sections.
pub fn merge_app_config(base: AppConfig, overlay: AppConfig, overlay_raw: &str) -> AppConfig {
    let mut providers = base.providers;
    for overlay_provider in overlay.providers {
        match providers.iter_mut().find(|p| p.id == overlay_provider.id) {
            Some(existing) => *existing = overlay_provider,
            None => providers.push(overlay_provider),
        }
    }

    // A serde default is indistinguishable from an explicit restatement,
    // so section replacement keys off the overlay document itself.
    let overlay_declares = |section: &str| {
        overlay_raw
            .lines()
            .any(|line| line.trim_start().starts_with(&format!("[{section}")))
    };

    AppConfig {
        pipeline: if overlay_declares("pipeline") {
            overlay.pipeline
        } else {
            base.pipeline
        },
        providers,
        circuit_breaker: if overlay_declares("circuit_breaker") {
            overlay.circuit_breaker
        } else {
            base.circuit_breaker
        },
        redis: overlay.redis.or(base.redis),
    }
}

/// Load `base.toml` plus an optional `<env>.toml` overlay from `dir`.
pub fn load_layered(dir: &Path, environment: &str) -> Result<AppConfig, PlatformError> {
    let base_path = dir.join("base.toml");
    let base = load_single_config(&base_path)?;

    let overlay_path = dir.join(format!("{environment}.toml"));
    if !overlay_path.exists() {
        return Ok(base);
    }

    let overlay_raw = fs::read_to_string(&overlay_path)
        .map_err(|e| PlatformError::Config(format!("read {}: {e}", overlay_path.display())))?;
    let overlay = load_single_config(&overlay_path)?;
    Ok(merge_app_config(base, overlay, &overlay_raw))
}
