//! Static plan catalog
//!
//! The catalog is the configuration-side source of plan definitions. A plan
//! row is provisioned in the store from here the first time it is billed.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use wizpix_shared::models::PlanSpec;

use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Currency {
    #[serde(rename = "CHF")]
    Chf,
    #[serde(rename = "EUR")]
    Eur,
    #[serde(rename = "USD")]
    Usd,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Chf, Currency::Eur, Currency::Usd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Chf => "CHF",
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
        }
    }

    /// Parse user input, falling back to CHF for anything unknown
    pub fn parse_or_default(input: Option<&str>) -> Self {
        input
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(Currency::Chf)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CHF" => Ok(Currency::Chf),
            "EUR" => Ok(Currency::Eur),
            "USD" => Ok(Currency::Usd),
            other => Err(BillingError::InvalidInput(format!(
                "unsupported currency '{other}'"
            ))),
        }
    }
}

/// Monthly price in minor units per currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanPrices {
    #[serde(rename = "CHF")]
    pub chf: i64,
    #[serde(rename = "EUR")]
    pub eur: i64,
    #[serde(rename = "USD")]
    pub usd: i64,
}

impl PlanPrices {
    pub fn get(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Chf => self.chf,
            Currency::Eur => self.eur,
            Currency::Usd => self.usd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDefinition {
    pub code: String,
    pub name: String,
    pub daily_credit_quota: i32,
    pub prices: PlanPrices,
    #[serde(skip)]
    price_ids: Vec<(Currency, String)>,
}

impl PlanDefinition {
    fn new(code: &str, name: &str, daily_credit_quota: i32, prices: PlanPrices) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            daily_credit_quota,
            prices,
            price_ids: Vec::new(),
        }
    }

    pub fn is_paid(&self) -> bool {
        Currency::ALL.iter().any(|c| self.prices.get(*c) > 0)
    }

    /// Payment processor price reference for this plan in `currency`
    pub fn price_id(&self, currency: Currency) -> Option<&str> {
        self.price_ids
            .iter()
            .find(|(c, _)| *c == currency)
            .map(|(_, id)| id.as_str())
    }

    pub fn set_price_id(&mut self, currency: Currency, price_id: impl Into<String>) {
        let price_id = price_id.into();
        match self.price_ids.iter_mut().find(|(c, _)| *c == currency) {
            Some(slot) => slot.1 = price_id,
            None => self.price_ids.push((currency, price_id)),
        }
    }

    /// Row definition used for lazy provisioning: CHF price, monthly interval
    pub fn to_spec(&self) -> PlanSpec {
        PlanSpec {
            code: self.code.clone(),
            name: self.name.clone(),
            price_cents: self.prices.chf,
            currency: Currency::Chf.as_str().to_string(),
            billing_interval: "month".to_string(),
            daily_credit_quota: self.daily_credit_quota,
            external_price_id: self.price_id(Currency::Chf).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self {
            plans: vec![
                PlanDefinition::new("free", "Free", 5, PlanPrices { chf: 0, eur: 0, usd: 0 }),
                PlanDefinition::new(
                    "hobby",
                    "Hobby",
                    50,
                    PlanPrices { chf: 500, eur: 450, usd: 550 },
                ),
                PlanDefinition::new(
                    "pro",
                    "Pro",
                    300,
                    PlanPrices { chf: 1000, eur: 950, usd: 1100 },
                ),
            ],
        }
    }
}

impl PlanCatalog {
    /// Built-in catalog with price ids from `STRIPE_PRICE_<PLAN>_<CURRENCY>`
    pub fn from_env() -> Self {
        let mut catalog = Self::default();
        for plan in &mut catalog.plans {
            for currency in Currency::ALL {
                let key = format!(
                    "STRIPE_PRICE_{}_{}",
                    plan.code.to_ascii_uppercase(),
                    currency.as_str()
                );
                if let Ok(price_id) = std::env::var(&key) {
                    if !price_id.trim().is_empty() {
                        plan.set_price_id(currency, price_id.trim());
                    }
                }
            }
        }
        catalog
    }

    pub fn get(&self, code: &str) -> Option<&PlanDefinition> {
        let code = code.trim().to_ascii_lowercase();
        self.plans.iter().find(|p| p.code == code)
    }

    pub fn get_mut(&mut self, code: &str) -> Option<&mut PlanDefinition> {
        let code = code.trim().to_ascii_lowercase();
        self.plans.iter_mut().find(|p| p.code == code)
    }

    pub fn list(&self) -> &[PlanDefinition] {
        &self.plans
    }
}
