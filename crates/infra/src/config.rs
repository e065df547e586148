use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub acme_base_url: String,
    pub acme_auth_url: String,
    pub acme_access_key: String,
    pub acme_secret_key: String,
    pub acme_timeout_ms: u64,
    pub acme_retry_attempts: u32,
    pub acme_retry_delay_ms: u64,
    pub acme_cache_ttl_ms: u64,
    pub acme_refresh_buffer_seconds: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("acme_base_url", "https://api.acme.com")?
            .set_default("acme_auth_url", "https://api.acme.com/auth")?
            .set_default("acme_access_key", "")?
            .set_default("acme_secret_key", "")?
            .set_default("acme_timeout_ms", 30_000)?
            .set_default("acme_retry_attempts", 3)?
            .set_default("acme_retry_delay_ms", 1_000)?
            .set_default("acme_cache_ttl_ms", 60_000)?
            .set_default("acme_refresh_buffer_seconds", 300)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}
