use funil_infra::acme_client::AcmeApiClient;
use funil_infra::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub acme: AcmeApiClient,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let acme = AcmeApiClient::from_config(&config);
        Self { config, acme }
    }
}
