use buildgrid_common::config::{ConfigLoader, DbConfig};
use buildgrid_common::tracing::TracingConfig;
use buildgrid_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerServiceConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub sweep: SweepConfig,
    pub limits: LimitsConfig,
    pub cors_origin_regex: String,
}

impl SafeDisplay for ControllerServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "storage:");
        let _ = writeln!(&mut result, "{}", self.storage.to_safe_string_indented());
        let _ = writeln!(&mut result, "auth:");
        let _ = writeln!(&mut result, "{}", self.auth.to_safe_string_indented());
        let _ = writeln!(&mut result, "sweep:");
        let _ = writeln!(&mut result, "{}", self.sweep.to_safe_string_indented());
        let _ = writeln!(&mut result, "limits:");
        let _ = writeln!(&mut result, "{}", self.limits.to_safe_string_indented());
        let _ = writeln!(&mut result, "CORS origin regex: {}", self.cors_origin_regex);
        result
    }
}

impl Default for ControllerServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("buildgrid-controller-service"),
            environment: "dev".to_string(),
            http_port: 8080,
            db: DbConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
            sweep: SweepConfig::default(),
            limits: LimitsConfig::default(),
            cors_origin_regex: "https://*.buildgrid.dev".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub source_max_bytes: u64,
    pub credentials_max_bytes: u64,
    pub result_max_bytes: u64,
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/artifacts"),
            source_max_bytes: 500 * 1024 * 1024,
            credentials_max_bytes: 50 * 1024 * 1024,
            result_max_bytes: 500 * 1024 * 1024,
            chunk_size: 64 * 1024,
        }
    }
}

impl SafeDisplay for StorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "root: {}", self.root.display());
        let _ = writeln!(&mut result, "source max bytes: {}", self.source_max_bytes);
        let _ = writeln!(
            &mut result,
            "credentials max bytes: {}",
            self.credentials_max_bytes
        );
        let _ = writeln!(&mut result, "result max bytes: {}", self.result_max_bytes);
        let _ = writeln!(&mut result, "chunk size: {}", self.chunk_size);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub admin_key: String,
    #[serde(with = "humantime_serde")]
    pub session_token_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub otp_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub guest_token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_key: "change-me-before-deploying".to_string(),
            session_token_ttl: Duration::from_secs(90),
            otp_ttl: Duration::from_secs(5 * 60),
            guest_token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SafeDisplay for AuthConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "admin key: ****");
        let _ = writeln!(
            &mut result,
            "session token TTL: {:?}",
            self.session_token_ttl
        );
        let _ = writeln!(&mut result, "OTP TTL: {:?}", self.otp_ttl);
        let _ = writeln!(&mut result, "guest token TTL: {:?}", self.guest_token_ttl);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub worker_staleness: Duration,
    #[serde(with = "humantime_serde")]
    pub token_cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub staging_grace: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            worker_staleness: Duration::from_secs(5 * 60),
            token_cleanup_interval: Duration::from_secs(10 * 60),
            staging_grace: Duration::from_secs(60 * 60),
        }
    }
}

impl SafeDisplay for SweepConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "interval: {:?}", self.interval);
        let _ = writeln!(&mut result, "worker staleness: {:?}", self.worker_staleness);
        let _ = writeln!(
            &mut result,
            "token cleanup interval: {:?}",
            self.token_cleanup_interval
        );
        let _ = writeln!(&mut result, "staging grace: {:?}", self.staging_grace);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_concurrent_requests: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 512,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for LimitsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "max concurrent requests: {}",
            self.max_concurrent_requests
        );
        let _ = writeln!(&mut result, "request timeout: {:?}", self.request_timeout);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ControllerServiceConfig> {
    ConfigLoader::new(&PathBuf::from("config/controller-service.toml"))
}
