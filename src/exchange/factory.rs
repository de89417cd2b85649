use std::sync::Arc;

use crate::adapters::{BinanceFuturesClient, BinanceFuturesConfig, PaperExchange};
use crate::config::{ExchangeSettings, SecretString};
use crate::decision::MarketDataSource;
use crate::error::{Result, TraderError};

use super::{parse_exchange_kind, ExchangeClient, ExchangeKind};

/// Account access plus market data, backed by the same venue connection
#[derive(Clone)]
pub struct Venue {
    pub exchange: Arc<dyn ExchangeClient>,
    pub market: Arc<dyn MarketDataSource>,
}

impl std::fmt::Debug for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Venue")
            .field("kind", &self.exchange.kind())
            .finish()
    }
}

/// Create the exchange client for one agent's settings.
///
/// Missing credentials are a configuration error: the agent must not start.
pub fn build_exchange_client(settings: &ExchangeSettings) -> Result<Arc<dyn ExchangeClient>> {
    build_venue(settings).map(|venue| venue.exchange)
}

pub fn build_venue(settings: &ExchangeSettings) -> Result<Venue> {
    let exchange = parse_exchange_kind(&settings.kind)?;
    build_venue_for(exchange, settings)
}

/// Create the venue for an explicit exchange kind.
pub fn build_venue_for(exchange: ExchangeKind, settings: &ExchangeSettings) -> Result<Venue> {
    match exchange {
        ExchangeKind::Binance => {
            let api_key = settings
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .or_else(|| std::env::var("BINANCE_API_KEY").ok())
                .ok_or_else(|| TraderError::Config("binance api_key is not set".to_string()))?;

            let api_secret = match settings.api_secret.as_ref().filter(|s| !s.is_empty()) {
                Some(secret) => secret.clone(),
                None => std::env::var("BINANCE_API_SECRET")
                    .map(SecretString::new)
                    .map_err(|_| TraderError::Config("binance api_secret is not set".to_string()))?,
            };

            let mut config = if settings.testnet {
                BinanceFuturesConfig::testnet()
            } else {
                BinanceFuturesConfig::default()
            };
            if let Some(rest_url) = &settings.rest_url {
                config.rest_url = rest_url.trim_end_matches('/').to_string();
            }
            if let Some(ws_url) = &settings.ws_url {
                config.ws_url = ws_url.trim_end_matches('/').to_string();
            }

            let client = Arc::new(BinanceFuturesClient::new(config, api_key, api_secret)?);
            Ok(Venue {
                exchange: client.clone(),
                market: client,
            })
        }
        ExchangeKind::Paper => {
            let paper = Arc::new(PaperExchange::new(settings.paper_balance));
            Ok(Venue {
                exchange: paper.clone(),
                market: paper,
            })
        }
    }
}
