use ct_domain::config::{Config, ConfigSeverity};

/// Validate the config, printing any issues. Returns false when at least
/// one issue is an error.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }

    println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");

    error_count == 0
}

/// Render the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serializing config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(validate(&Config::default(), "config.toml"));
    }

    #[test]
    fn zero_base_delay_fails_validation() {
        let mut config = Config::default();
        config.connection.base_delay_ms = 0;
        assert!(!validate(&config, "config.toml"));
    }

    #[test]
    fn shown_config_parses_back() {
        let rendered = show(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, Config::default().server.port);
        assert_eq!(parsed.bridge.url, Config::default().bridge.url);
    }
}
