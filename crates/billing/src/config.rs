//! Billing configuration
//!
//! Payment-link catalog, seat pricing and the webhook secret, read from the
//! environment at startup.

use std::collections::HashMap;

use rewritely_shared::BillingPeriod;
use url::Url;

use crate::error::{BillingError, BillingResult};

/// Payment-initiation targets for the plans sold through payment links
#[derive(Debug, Clone, Default)]
pub struct CheckoutCatalog {
    links: HashMap<(String, BillingPeriod), Url>,
}

impl CheckoutCatalog {
    /// Parse `plan:period=url` entries separated by commas
    pub fn parse(raw: &str) -> BillingResult<Self> {
        let mut catalog = Self::default();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, url) = entry.split_once('=').ok_or_else(|| {
                BillingError::Config(format!("PAYMENT_LINKS entry without '=': {}", entry))
            })?;
            let (plan_id, period) = key.split_once(':').ok_or_else(|| {
                BillingError::Config(format!("PAYMENT_LINKS key without ':': {}", key))
            })?;
            let period: BillingPeriod = period
                .trim()
                .parse()
                .map_err(|e| BillingError::Config(format!("PAYMENT_LINKS: {}", e)))?;
            let url = Url::parse(url.trim())
                .map_err(|e| BillingError::Config(format!("PAYMENT_LINKS url {}: {}", url, e)))?;

            catalog.insert(plan_id.trim(), period, url);
        }

        Ok(catalog)
    }

    pub fn insert(&mut self, plan_id: &str, period: BillingPeriod, url: Url) {
        self.links.insert((plan_id.to_string(), period), url);
    }

    pub fn link(&self, plan_id: &str, period: BillingPeriod) -> Option<&Url> {
        self.links.get(&(plan_id.to_string(), period))
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Pricing for the seat-based plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamPricing {
    pub plan_id: String,
    /// Monthly price of one seat
    pub seat_price_cents: i64,
    pub min_seats: u32,
    pub currency: String,
}

impl Default for TeamPricing {
    fn default() -> Self {
        Self {
            plan_id: "team".to_string(),
            seat_price_cents: 3999,
            min_seats: 5,
            currency: "hkd".to_string(),
        }
    }
}

impl TeamPricing {
    /// Yearly seats cost ten months
    pub fn unit_amount_cents(&self, period: BillingPeriod) -> i64 {
        match period {
            BillingPeriod::Monthly => self.seat_price_cents,
            BillingPeriod::Yearly => self.seat_price_cents * 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub webhook_secret: String,
    pub catalog: CheckoutCatalog,
    pub team: TeamPricing,
}

impl BillingConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            catalog: CheckoutCatalog::default(),
            team: TeamPricing::default(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let catalog = CheckoutCatalog::parse(&std::env::var("PAYMENT_LINKS").unwrap_or_default())?;
        if catalog.is_empty() {
            tracing::warn!("PAYMENT_LINKS is empty; payment-link checkout is unavailable");
        }

        let defaults = TeamPricing::default();
        let team = TeamPricing {
            plan_id: defaults.plan_id,
            seat_price_cents: env_number("TEAM_SEAT_PRICE_CENTS", defaults.seat_price_cents)?,
            min_seats: env_number("TEAM_MIN_SEATS", defaults.min_seats)?,
            currency: std::env::var("TEAM_CURRENCY").unwrap_or(defaults.currency),
        };

        Ok(Self {
            webhook_secret,
            catalog,
            team,
        })
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_catalog_parse() {
        let catalog = CheckoutCatalog::parse(
            "starter:monthly=https://buy.stripe.com/s_m, starter:yearly=https://buy.stripe.com/s_y?locale=en",
        )
        .unwrap();

        assert_eq!(
            catalog.link("starter", BillingPeriod::Monthly).unwrap().as_str(),
            "https://buy.stripe.com/s_m"
        );
        assert!(catalog.link("starter", BillingPeriod::Yearly).is_some());
        assert!(catalog.link("professional", BillingPeriod::Monthly).is_none());
    }

    #[test]
    fn test_catalog_rejects_bad_entries() {
        assert!(CheckoutCatalog::parse("starter=https://x").is_err());
        assert!(CheckoutCatalog::parse("starter:weekly=https://x").is_err());
        assert!(CheckoutCatalog::parse("starter:monthly=not a url").is_err());
        assert!(CheckoutCatalog::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_team_unit_price() {
        let team = TeamPricing::default();
        assert_eq!(team.unit_amount_cents(BillingPeriod::Monthly), 3999);
        assert_eq!(team.unit_amount_cents(BillingPeriod::Yearly), 39990);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("PAYMENT_LINKS", "professional:monthly=https://buy.stripe.com/p_m");
        std::env::set_var("TEAM_MIN_SEATS", "3");
        std::env::remove_var("TEAM_SEAT_PRICE_CENTS");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.webhook_secret, "whsec_test");
        assert_eq!(config.team.min_seats, 3);
        assert_eq!(config.team.seat_price_cents, 3999);
        assert!(config.catalog.link("professional", BillingPeriod::Monthly).is_some());

        std::env::set_var("TEAM_MIN_SEATS", "many");
        assert!(BillingConfig::from_env().is_err());

        std::env::remove_var("TEAM_MIN_SEATS");
        std::env::remove_var("PAYMENT_LINKS");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
    }
}
