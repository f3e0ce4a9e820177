//! Invoices: period roll-ups of usage into billable line items.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::usage::{BillingPeriod, UsageMetric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
    Refunded,
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub metric: UsageMetric,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub amount: Decimal,
}

/// Generate a stable invoice number: `INV-YYYY-MM-<8 upper alphanumerics>`.
pub fn generate_invoice_number(period: &BillingPeriod) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("INV-{}-{}", period.0, suffix)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    pub number: String,
    pub period: BillingPeriod,
    pub status: InvoiceStatus,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub due_date: Option<DateTime<Utc>>,
    pub payment_reference: Option<String>,
    pub void_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Invariant: total = subtotal - discount + tax.
    pub fn totals_consistent(&self) -> bool {
        self.total == self.subtotal - self.discount + self.tax
    }

    /// Finalize: draft → sent, due 30 days out. Idempotent once sent.
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            InvoiceStatus::Draft => {
                self.status = InvoiceStatus::Sent;
                self.finalized_at = Some(now);
                self.due_date = Some(now + chrono::Duration::days(30));
                Ok(())
            }
            InvoiceStatus::Sent | InvoiceStatus::Paid => Ok(()),
            other => Err(Error::business_rule(
                "invoice_finalize",
                format!("cannot finalize invoice in state {other}"),
            )),
        }
    }

    /// Mark paid. Idempotent; the first payment reference wins.
    pub fn mark_paid(&mut self, reference: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            InvoiceStatus::Sent | InvoiceStatus::Overdue => {
                self.status = InvoiceStatus::Paid;
                self.payment_reference = Some(reference.into());
                self.paid_at = Some(now);
                Ok(())
            }
            InvoiceStatus::Paid => Ok(()),
            other => Err(Error::business_rule(
                "invoice_mark_paid",
                format!("cannot pay invoice in state {other}"),
            )),
        }
    }

    /// Void: draft or sent → cancelled. Idempotent.
    pub fn void(&mut self, reason: impl Into<String>) -> Result<()> {
        match self.status {
            InvoiceStatus::Draft | InvoiceStatus::Sent | InvoiceStatus::Overdue => {
                self.status = InvoiceStatus::Cancelled;
                self.void_reason = Some(reason.into());
                Ok(())
            }
            InvoiceStatus::Cancelled => Ok(()),
            other => Err(Error::business_rule(
                "invoice_void",
                format!("cannot void invoice in state {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn invoice() -> Invoice {
        Invoice {
            id: "inv-1".into(),
            tenant_id: "t-1".into(),
            number: generate_invoice_number(&BillingPeriod("2024-01".into())),
            period: BillingPeriod("2024-01".into()),
            status: InvoiceStatus::Draft,
            currency: "USD".into(),
            line_items: vec![],
            subtotal: dec!(100.0000),
            discount: dec!(10.0000),
            tax: dec!(7.2000),
            total: dec!(97.2000),
            due_date: None,
            payment_reference: None,
            void_reason: None,
            created_at: Utc::now(),
            finalized_at: None,
            paid_at: None,
        }
    }

    #[test]
    fn number_format() {
        let n = generate_invoice_number(&BillingPeriod("2024-01".into()));
        assert!(n.starts_with("INV-2024-01-"));
        let suffix = n.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn totals_invariant() {
        assert!(invoice().totals_consistent());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut inv = invoice();
        let now = Utc::now();
        inv.finalize(now).unwrap();
        let number = inv.number.clone();
        let due = inv.due_date;
        inv.finalize(now + chrono::Duration::hours(1)).unwrap();
        assert_eq!(inv.number, number);
        assert_eq!(inv.due_date, due);
        assert_eq!(inv.status, InvoiceStatus::Sent);
    }

    #[test]
    fn pay_then_void_is_rejected() {
        let mut inv = invoice();
        let now = Utc::now();
        inv.finalize(now).unwrap();
        inv.mark_paid("pay_123", now).unwrap();
        assert!(inv.void("mistake").is_err());
        // Paying again is a no-op, keeps the first reference.
        inv.mark_paid("pay_456", now).unwrap();
        assert_eq!(inv.payment_reference.as_deref(), Some("pay_123"));
    }

    #[test]
    fn cannot_pay_a_draft() {
        let mut inv = invoice();
        assert!(inv.mark_paid("pay_123", Utc::now()).is_err());
    }
}
