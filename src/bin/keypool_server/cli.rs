use std::path::PathBuf;

use clap::Parser;
use keypool::PoolConfig;

/// keypool-server - shared Gemini API key pool
#[derive(Parser, Debug)]
#[command(name = "keypool-server")]
#[command(author, version, about, long_about = None)]
pub(crate) struct ServerArgs {
    /// TOML configuration file
    #[arg(long, value_name = "PATH", env = "KEYPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (overrides `listen` from the config file)
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Instance identity used in the usage ledger
    #[arg(long, env = "KEYPOOL_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Persist credentials and ledgers in a SQLite file
    #[arg(long, value_name = "PATH", conflicts_with = "redis")]
    pub sqlite: Option<PathBuf>,

    /// Persist credentials and ledgers in Redis
    #[arg(long, value_name = "URL")]
    pub redis: Option<String>,

    /// Key prefix inside Redis
    #[arg(long, requires = "redis")]
    pub redis_prefix: Option<String>,

    /// Read-write admin token
    #[arg(long, env = "KEYPOOL_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Read the read-write admin token from this environment variable
    #[arg(long, value_name = "VAR", conflicts_with = "admin_token")]
    pub admin_token_env: Option<String>,

    /// Read-only admin token
    #[arg(long, env = "KEYPOOL_ADMIN_READ_TOKEN", hide_env_values = true)]
    pub admin_read_token: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Export spans over OTLP/HTTP
    #[arg(long)]
    pub otel: bool,

    /// OTLP endpoint (implies --otel)
    #[arg(long, value_name = "URL")]
    pub otel_endpoint: Option<String>,
}

impl ServerArgs {
    pub fn otel_enabled(&self) -> bool {
        self.otel || self.otel_endpoint.is_some()
    }

    pub fn apply(&self, config: &mut PoolConfig) {
        if let Some(listen) = self.listen.as_ref() {
            config.listen = listen.clone();
        }
        if let Some(instance_id) = self.instance_id.as_ref() {
            config.instance_id = Some(instance_id.clone());
        }
    }

    pub fn write_token(&self) -> Result<Option<String>, Box<dyn std::error::Error>> {
        if let Some(var) = self.admin_token_env.as_deref() {
            let token = std::env::var(var)
                .map_err(|_| format!("environment variable {var} is not set"))?;
            return Ok(non_blank(token));
        }
        Ok(self.admin_token.clone().and_then(non_blank))
    }

    pub fn read_token(&self) -> Option<String> {
        self.admin_read_token.clone().and_then(non_blank)
    }
}

fn non_blank(token: String) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        ServerArgs::command().debug_assert();
    }

    #[test]
    fn sqlite_and_redis_are_exclusive() {
        let err = ServerArgs::try_parse_from([
            "keypool-server",
            "--sqlite",
            "pool.sqlite",
            "--redis",
            "redis://127.0.0.1/",
        ])
        .expect_err("conflict");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn flags_override_config() {
        let args = ServerArgs::try_parse_from([
            "keypool-server",
            "--listen",
            "0.0.0.0:9000",
            "--instance-id",
            "pool-a",
        ])
        .expect("parse");
        let mut config = PoolConfig::default();
        args.apply(&mut config);
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.instance_id(), "pool-a");
    }

    #[test]
    fn otel_endpoint_implies_otel() {
        let args = ServerArgs::try_parse_from([
            "keypool-server",
            "--otel-endpoint",
            "http://127.0.0.1:4318/v1/traces",
        ])
        .expect("parse");
        assert!(args.otel_enabled());
    }
}
