use std::path::PathBuf;

use config::{Config, Environment, File};

use super::AppConfig;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "analyst.toml";

/// Loads the configuration from an optional TOML file plus environment
/// overrides, then validates it.
///
/// A missing file is not an error; defaults and the environment still
/// apply. Environment keys nest with `__`, e.g.
/// `ANALYST__SESSION__BACKEND=redis` or
/// `ANALYST__SESSION__RATE_LIMIT__TRUSTED_PROXIES=10.0.0.0/8,192.0.2.1`.
pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
    let mut builder = Config::builder();
    let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
    if pathbuf.exists() {
        builder = builder.add_source(File::from(pathbuf));
    }
    builder = builder.add_source(
        Environment::with_prefix("ANALYST")
            .try_parsing(true)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("session.rate_limit.trusted_proxies"),
    );
    let cfg = builder
        .build()
        .map_err(|e| format!("config build error: {e}"))?;
    let merged: AppConfig = cfg
        .try_deserialize()
        .map_err(|e| format!("config deserialize error: {e}"))?;
    merged.validate()?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyst_session::{BackendKind, FailurePolicy};
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[logging]
level = "debug"

[session]
backend = "memory"

[session.rate_limit]
failure_policy = "fail_open"
trusted_proxies = ["10.0.0.0/8"]

[session.rate_limit.anonymous]
limit = 10
window = "30s"

[session.tokens]
sliding_window = "3days"
"#
        )
        .unwrap();

        let cfg = load_config(file.path().to_str()).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.session.backend, BackendKind::Memory);
        assert_eq!(cfg.session.rate_limit.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(cfg.session.rate_limit.trusted_proxies, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(cfg.session.rate_limit.anonymous.limit, 10);
        assert_eq!(cfg.session.rate_limit.anonymous.window, Duration::from_secs(30));
        assert_eq!(cfg.session.rate_limit.authenticated.limit, 100);
        assert_eq!(cfg.session.tokens.sliding_window, Duration::from_secs(3 * 86_400));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = load_config(Some("/nonexistent/analyst.toml")).unwrap();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.session.backend, BackendKind::Memory);
    }

    #[test]
    fn test_invalid_file_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[session.rate_limit]\ntrusted_proxies = [\"proxy.internal\"]").unwrap();
        let err = load_config(file.path().to_str()).unwrap_err();
        assert!(err.contains("trusted_proxies"));
    }
}
