// ABOUTME: Shared CLI argument parsing and settings builder for the binaries
// ABOUTME: Endpoint flags flattened into each binary, tracing setup and startup logging

use crate::endpoint::Settings;
use crate::transport::{LogLevel, Profile};
use clap::Args;
use std::path::PathBuf;

/// Endpoint arguments shared between binaries
///
/// Use with `#[command(flatten)]` in your binary's Args struct:
/// ```ignore
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     endpoint: EndpointArgs,
///
///     // Binary-specific args here
/// }
/// ```
#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// JSON settings file; flags given on the command line override it
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// RIST profile
    #[arg(long, value_enum)]
    pub profile: Option<Profile>,

    /// Transport log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Pre-shared key (enables 128 bit encryption)
    #[arg(long)]
    pub psk: Option<String>,

    /// Canonical name announced to peers
    #[arg(long)]
    pub cname: Option<String>,

    /// Session timeout in milliseconds
    #[arg(long)]
    pub session_timeout: Option<u32>,

    /// Keep-alive interval in milliseconds
    #[arg(long)]
    pub keep_alive: Option<u32>,

    /// Maximum jitter in milliseconds (0 keeps the transport default)
    #[arg(long)]
    pub max_jitter: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl EndpointArgs {
    /// Initialize tracing based on verbosity flag
    ///
    /// Records from the `log` facade are bridged into the subscriber.
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "ristnet=debug"
        } else {
            "ristnet=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self, settings: &Settings) {
        tracing::info!("ristnet v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!(
            "Profile: {:?}, transport log level: {:?}",
            settings.profile,
            settings.log_level
        );
        tracing::info!(
            "Session timeout: {} ms, keep-alive: {} ms, max jitter: {} ms",
            settings.session_timeout,
            settings.keep_alive_interval,
            settings.max_jitter
        );
        if !settings.psk.is_empty() {
            tracing::info!("Encryption: PSK, 128 bit");
        }
    }

    /// Build endpoint settings: defaults, then the settings file, then flags
    pub fn build_settings(&self) -> crate::Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::from_json_file(path)?,
            None => Settings::new(),
        };

        if let Some(profile) = self.profile {
            settings = settings.profile(profile);
        }
        if let Some(level) = self.log_level {
            settings = settings.log_level(level);
        }
        if let Some(psk) = &self.psk {
            settings = settings.psk(psk.clone());
        }
        if let Some(cname) = &self.cname {
            settings = settings.cname(cname.clone());
        }
        if let Some(ms) = self.session_timeout {
            settings = settings.session_timeout(ms);
        }
        if let Some(ms) = self.keep_alive {
            settings = settings.keep_alive_interval(ms);
        }
        if let Some(ms) = self.max_jitter {
            settings = settings.max_jitter(ms);
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        endpoint: EndpointArgs,
    }

    #[test]
    fn test_default_args() {
        let args = TestArgs::parse_from(["test"]);
        let settings = args.endpoint.build_settings().unwrap();

        assert!(!args.endpoint.verbose);
        assert_eq!(settings.profile, Profile::Main);
        assert_eq!(settings.log_level, LogLevel::Info);
        assert_eq!(settings.session_timeout, 5000);
        assert_eq!(settings.max_jitter, 0);
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = TestArgs::parse_from([
            "test",
            "--profile",
            "simple",
            "--log-level",
            "debug",
            "--psk",
            "secret",
            "--max-jitter",
            "30",
            "-v",
        ]);
        let settings = args.endpoint.build_settings().unwrap();

        assert!(args.endpoint.verbose);
        assert_eq!(settings.profile, Profile::Simple);
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.psk, "secret");
        assert_eq!(settings.max_jitter, 30);
    }

    #[test]
    fn test_flags_override_settings_file() {
        let path = std::env::temp_dir().join(format!("ristnet-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"cname":"from-file","session_timeout":2500}"#).unwrap();

        let args = TestArgs::parse_from([
            "test".to_string(),
            "--settings".to_string(),
            path.display().to_string(),
            "--cname".to_string(),
            "from-flag".to_string(),
        ]);
        let settings = args.endpoint.build_settings().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.cname, "from-flag");
        assert_eq!(settings.session_timeout, 2500);
    }

    #[test]
    fn test_missing_settings_file() {
        let args = TestArgs::parse_from(["test", "--settings", "/nonexistent/ristnet.json"]);
        assert!(matches!(
            args.endpoint.build_settings(),
            Err(crate::error::Error::Settings(_))
        ));
    }
}
