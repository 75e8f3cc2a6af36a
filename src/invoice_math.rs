// src/invoice_math.rs
//
// VAT/CIS arithmetic and payment-frequency due dates for invoice creation.
// VAT is added on top of the subtotal; CIS is withheld from it.

use chrono::{Months, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::PaymentFrequency;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub vat_amount: Decimal,
    pub cis_amount: Decimal,
    pub total_amount: Decimal,
}

/// Applies percentage VAT and CIS rates to a subtotal. Rates are validated
/// non-negative by the caller; there are no failure modes here.
pub fn calculate(subtotal: Decimal, vat_rate_pct: Decimal, cis_rate_pct: Decimal) -> InvoiceTotals {
    let vat_amount = subtotal * vat_rate_pct / dec!(100);
    let cis_amount = subtotal * cis_rate_pct / dec!(100);
    InvoiceTotals {
        vat_amount,
        cis_amount,
        total_amount: subtotal + vat_amount - cis_amount,
    }
}

/// Computes the invoice due date from the user's payment cadence. An unset
/// frequency falls back to monthly. The monthly step preserves the
/// day-of-month where the target month supports it and clamps to the last
/// day otherwise.
pub fn due_date(created_at: NaiveDate, frequency: Option<PaymentFrequency>) -> NaiveDate {
    match frequency.unwrap_or(PaymentFrequency::Monthly) {
        PaymentFrequency::Weekly => created_at + chrono::Duration::days(7),
        PaymentFrequency::Fortnightly => created_at + chrono::Duration::days(14),
        PaymentFrequency::Monthly => created_at
            .checked_add_months(Months::new(1))
            .expect("date overflow adding one month to invoice creation date"),
    }
}

#[cfg(test)]
mod invoice_math_tests {
    use super::*;

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .unwrap_or_else(|_| panic!("Invalid date string format: {}", date_str))
    }

    #[test]
    fn vat_adds_and_cis_withholds() {
        let totals = calculate(dec!(1000), dec!(20), dec!(20));
        assert_eq!(totals.vat_amount, dec!(200));
        assert_eq!(totals.cis_amount, dec!(200));
        // Equal VAT and CIS cancel out.
        assert_eq!(totals.total_amount, dec!(1000));
    }

    #[test]
    fn zero_rates_leave_subtotal_untouched() {
        let totals = calculate(dec!(150), dec!(0), dec!(0));
        assert_eq!(totals.vat_amount, dec!(0));
        assert_eq!(totals.cis_amount, dec!(0));
        assert_eq!(totals.total_amount, dec!(150));
    }

    #[test]
    fn fractional_subtotal_keeps_exact_amounts() {
        let totals = calculate(dec!(150.00), dec!(5), dec!(0));
        assert_eq!(totals.vat_amount, dec!(7.50));
        assert_eq!(totals.total_amount, dec!(157.50));
    }

    #[test]
    fn due_date_per_frequency() {
        let created = d("2024-01-15");
        assert_eq!(
            due_date(created, Some(PaymentFrequency::Weekly)),
            d("2024-01-22")
        );
        assert_eq!(
            due_date(created, Some(PaymentFrequency::Fortnightly)),
            d("2024-01-29")
        );
        assert_eq!(
            due_date(created, Some(PaymentFrequency::Monthly)),
            d("2024-02-15")
        );
    }

    #[test]
    fn due_date_defaults_to_monthly_when_frequency_unset() {
        assert_eq!(due_date(d("2024-01-15"), None), d("2024-02-15"));
    }

    #[test]
    fn monthly_due_date_clamps_to_month_end() {
        assert_eq!(
            due_date(d("2024-01-31"), Some(PaymentFrequency::Monthly)),
            d("2024-02-29")
        );
        assert_eq!(
            due_date(d("2023-01-31"), Some(PaymentFrequency::Monthly)),
            d("2023-02-28")
        );
    }
}
