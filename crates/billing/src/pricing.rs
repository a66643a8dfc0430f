//! Plans and prices
//!
//! A kit can be unlocked with a single one-off payment or with a daily
//! subscription whose unit price, charged `subscription_cycle_cap` times,
//! adds up to the same total. The subscription has no natural end date; it is
//! cancelled by the webhook processor once the cap of paid invoices is reached.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_ONEOFF_PRICE_CENTS: i64 = 3700;
pub const DEFAULT_DAILY_PRICE_CENTS: i64 = 100;
pub const DEFAULT_SUBSCRIPTION_CYCLE_CAP: u32 = 37;
pub const DEFAULT_KIT_CREDIT_COST: i64 = 750;
pub const CURRENCY: &str = "usd";

/// How a checkout is paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    OneOff,
    Subscription,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::OneOff => "oneoff",
            PlanType::Subscription => "subscription",
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, PlanType::Subscription)
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oneoff" | "one_off" => Ok(PlanType::OneOff),
            "subscription" => Ok(PlanType::Subscription),
            other => Err(BillingError::InvalidInput(format!(
                "unknown plan type '{}' (expected 'oneoff' or 'subscription')",
                other
            ))),
        }
    }
}

/// Prices and costs, loaded once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingConfig {
    pub oneoff_price_cents: i64,
    pub daily_price_cents: i64,
    pub subscription_cycle_cap: u32,
    /// Credits debited by the kit creation saga
    pub kit_credit_cost: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            oneoff_price_cents: DEFAULT_ONEOFF_PRICE_CENTS,
            daily_price_cents: DEFAULT_DAILY_PRICE_CENTS,
            subscription_cycle_cap: DEFAULT_SUBSCRIPTION_CYCLE_CAP,
            kit_credit_cost: DEFAULT_KIT_CREDIT_COST,
        }
    }
}

impl PricingConfig {
    /// Load from environment, falling back to defaults for unset variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let config = Self {
            oneoff_price_cents: env_or("ONEOFF_PRICE_CENTS", defaults.oneoff_price_cents)?,
            daily_price_cents: env_or("DAILY_PRICE_CENTS", defaults.daily_price_cents)?,
            subscription_cycle_cap: env_or(
                "SUBSCRIPTION_CYCLE_CAP",
                defaults.subscription_cycle_cap,
            )?,
            kit_credit_cost: env_or("KIT_CREDIT_COST", defaults.kit_credit_cost)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// The subscription must add up to exactly the one-off price
    pub fn validate(&self) -> BillingResult<()> {
        if self.oneoff_price_cents <= 0 || self.daily_price_cents <= 0 {
            return Err(BillingError::Config("prices must be positive".to_string()));
        }
        if self.subscription_cycle_cap == 0 {
            return Err(BillingError::Config(
                "SUBSCRIPTION_CYCLE_CAP must be at least 1".to_string(),
            ));
        }
        if self.kit_credit_cost <= 0 {
            return Err(BillingError::Config(
                "KIT_CREDIT_COST must be positive".to_string(),
            ));
        }
        let subscription_total = self
            .daily_price_cents
            .checked_mul(i64::from(self.subscription_cycle_cap))
            .ok_or_else(|| {
                BillingError::Config(format!(
                    "daily price {} x {} cycles overflows",
                    self.daily_price_cents, self.subscription_cycle_cap
                ))
            })?;
        if subscription_total != self.oneoff_price_cents {
            return Err(BillingError::Config(format!(
                "daily price {} x {} cycles = {} does not match one-off price {}",
                self.daily_price_cents,
                self.subscription_cycle_cap,
                subscription_total,
                self.oneoff_price_cents
            )));
        }
        Ok(())
    }

    /// Amount charged when the checkout session completes
    pub fn checkout_amount(&self, plan: PlanType) -> i64 {
        match plan {
            PlanType::OneOff => self.oneoff_price_cents,
            PlanType::Subscription => self.daily_price_cents,
        }
    }

    /// Whether a subscription with `paid_invoices` paid invoices must be cancelled
    pub fn subscription_cap_reached(&self, paid_invoices: u64) -> bool {
        paid_invoices >= u64::from(self.subscription_cycle_cap)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}
