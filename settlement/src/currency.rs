//! Currency conversion into the settlement currency

use crate::{config::CurrencyConfig, Error, Result};
use ledger_core::CurrencyCode;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

/// Minor units kept after converting a foreign amount
const CONVERTED_SCALE: u32 = 2;

/// Converts client amounts into the settlement currency
pub trait CurrencyConverter: Send + Sync {
    /// Convert `amount` of `currency` into the settlement currency
    fn convert(&self, currency: &CurrencyCode, amount: Decimal) -> Result<Decimal>;
}

/// Converter over a fixed rate table
#[derive(Debug, Clone)]
pub struct FixedRateConverter {
    base: CurrencyCode,
    rates: HashMap<CurrencyCode, Decimal>,
}

impl FixedRateConverter {
    /// Create a converter for `base` with no foreign rates
    pub fn new(base: CurrencyCode) -> Self {
        Self {
            base,
            rates: HashMap::new(),
        }
    }

    /// Add a rate: base units per one unit of `currency`
    pub fn with_rate(mut self, currency: CurrencyCode, rate: Decimal) -> Self {
        self.rates.insert(currency, rate);
        self
    }

    /// Build from configuration
    pub fn from_config(config: &CurrencyConfig) -> Result<Self> {
        let base = CurrencyCode::new(&config.base)?;
        let mut converter = Self::new(base);
        for (code, rate) in &config.rates {
            if *rate <= Decimal::ZERO {
                return Err(Error::Config(format!(
                    "currency rate for {} must be positive",
                    code
                )));
            }
            converter = converter.with_rate(CurrencyCode::new(code)?, *rate);
        }
        Ok(converter)
    }

    /// Settlement currency
    pub fn base(&self) -> &CurrencyCode {
        &self.base
    }
}

impl CurrencyConverter for FixedRateConverter {
    fn convert(&self, currency: &CurrencyCode, amount: Decimal) -> Result<Decimal> {
        if *currency == self.base {
            return Ok(amount);
        }

        let rate = self
            .rates
            .get(currency)
            .ok_or_else(|| Error::UnsupportedCurrency(currency.to_string()))?;

        let converted = amount.checked_mul(*rate).ok_or_else(|| {
            ledger_core::Error::InvalidAmount(format!(
                "{} {} is out of range once converted",
                amount, currency
            ))
        })?;
        Ok(converted.round_dp_with_strategy(CONVERTED_SCALE, RoundingStrategy::MidpointAwayFromZero))
    }
}
