//! # Utilities Module
//!
//! Common helpers used throughout the counter cache service: operation timing
//! and money formatting for logs and API payloads.

use rust_decimal::Decimal;
use std::time::Instant;

/// Performance timer for measuring operation duration
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    /// Start a new timer with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("Timer '{}' completed in {}ms", self.name, elapsed);
        elapsed
    }
}

/// Money formatting utilities
pub struct MoneyUtils;

impl MoneyUtils {
    /// Format a monetary value with thousands separators, e.g. `£1,234,567.89`
    pub fn format_gbp(value: Decimal) -> String {
        let rounded = value.round_dp(2);
        let negative = rounded.is_sign_negative();
        let text = rounded.abs().to_string();

        let (whole, fraction) = match text.split_once('.') {
            Some((w, f)) => (w.to_string(), format!("{:0<2}", f)),
            None => (text, "00".to_string()),
        };

        let mut grouped = String::new();
        for (i, digit) in whole.chars().enumerate() {
            if i > 0 && (whole.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(digit);
        }

        let sign = if negative { "-" } else { "" };
        format!("{}£{}.{}", sign, grouped, fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gbp() {
        assert_eq!(MoneyUtils::format_gbp(Decimal::new(123456789, 2)), "£1,234,567.89");
        assert_eq!(MoneyUtils::format_gbp(Decimal::new(50, 0)), "£50.00");
        assert_eq!(MoneyUtils::format_gbp(Decimal::ZERO), "£0.00");
        assert_eq!(MoneyUtils::format_gbp(Decimal::new(-1500, 0)), "-£1,500.00");
    }

    #[test]
    fn test_timer_elapsed() {
        let timer = Timer::new("test");
        assert!(timer.elapsed_ms() < 1000);
    }
}
