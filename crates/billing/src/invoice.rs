//! Invoice building: roll a billing period's usage events into line
//! items, apply discount and tax, and drive the draft → sent → paid
//! lifecycle.
//!
//! Materialization is serialized per (tenant, period) behind a keyed
//! mutex, so concurrent builds of the same period converge on one
//! invoice with one number. Once sent, line items and totals are frozen.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::Mutex;

use voxgate_core::{
    generate_invoice_number, BillingPeriod, Error, Invoice, InvoiceStatus, LineItem, Result,
    Tenant, UsageMetric,
};
use voxgate_store::{InvoiceStore, TenantStore, UsageLedger};

#[derive(Clone)]
pub struct InvoiceBuilder {
    ledger: Arc<dyn UsageLedger>,
    invoices: Arc<dyn InvoiceStore>,
    tenants: Arc<dyn TenantStore>,
    /// Flat tax rate, e.g. 0.08.
    tax_rate: Decimal,
    /// Serializes materialization per (tenant, period).
    period_locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

fn round4(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven)
}

impl InvoiceBuilder {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        invoices: Arc<dyn InvoiceStore>,
        tenants: Arc<dyn TenantStore>,
        tax_rate: f64,
    ) -> Self {
        Self {
            ledger,
            invoices,
            tenants,
            tax_rate: Decimal::from_f64(tax_rate).unwrap_or(Decimal::ZERO),
            period_locks: Arc::new(DashMap::new()),
        }
    }

    fn period_lock(&self, tenant_id: &str, period: &BillingPeriod) -> Arc<Mutex<()>> {
        self.period_locks
            .entry((tenant_id.to_string(), period.0.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Materialize the invoice for (tenant, period), or return the one
    /// already built. Concurrent callers get the same invoice number.
    pub async fn materialize(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Invoice> {
        let lock = self.period_lock(tenant_id, period);
        let _guard = lock.lock().await;

        if let Some(existing) = self
            .invoices
            .get_for_period(tenant_id, period)
            .await
            .map_err(Error::from)?
        {
            return Ok(existing);
        }

        let tenant = self
            .tenants
            .get(tenant_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("tenant"))?;

        let invoice = self.build(&tenant, period).await?;
        self.invoices.upsert(&invoice).await.map_err(Error::from)?;

        tracing::info!(
            tenant_id = %tenant_id,
            period = %period,
            number = %invoice.number,
            total = %invoice.total,
            "invoice materialized"
        );
        Ok(invoice)
    }

    async fn build(&self, tenant: &Tenant, period: &BillingPeriod) -> Result<Invoice> {
        let events = self
            .ledger
            .events_for_period(&tenant.id, period)
            .await
            .map_err(Error::from)?;

        // Group by metric; BTreeMap keeps line items in a stable order.
        let mut grouped: BTreeMap<&'static str, (UsageMetric, f64, Decimal)> = BTreeMap::new();
        for event in &events {
            let entry = grouped
                .entry(event.metric.as_str())
                .or_insert((event.metric, 0.0, Decimal::ZERO));
            entry.1 += event.quantity;
            entry.2 += event.cost;
        }

        let line_items: Vec<LineItem> = grouped
            .into_values()
            .map(|(metric, quantity, amount)| LineItem {
                metric,
                description: format!("{} usage for {}", metric, period),
                quantity,
                unit: metric.unit().to_string(),
                amount: round4(amount),
            })
            .collect();

        let subtotal = round4(line_items.iter().map(|li| li.amount).sum());
        let discount = round4(
            subtotal * Decimal::from_f64(tenant.discount_rate).unwrap_or(Decimal::ZERO),
        );
        let tax = round4((subtotal - discount) * self.tax_rate);
        let total = subtotal - discount + tax;

        Ok(Invoice {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.id.clone(),
            number: generate_invoice_number(period),
            period: period.clone(),
            status: InvoiceStatus::Draft,
            currency: tenant.currency.clone(),
            line_items,
            subtotal,
            discount,
            tax,
            total,
            due_date: None,
            payment_reference: None,
            void_reason: None,
            created_at: Utc::now(),
            finalized_at: None,
            paid_at: None,
        })
    }

    /// Finalize the period's invoice (materializing if needed). Repeat
    /// calls return the same number.
    pub async fn finalize(&self, tenant_id: &str, period: &BillingPeriod) -> Result<Invoice> {
        let mut invoice = self.materialize(tenant_id, period).await?;

        let lock = self.period_lock(tenant_id, period);
        let _guard = lock.lock().await;
        invoice.finalize(Utc::now())?;
        self.invoices.upsert(&invoice).await.map_err(Error::from)?;
        Ok(invoice)
    }

    pub async fn mark_paid(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
        payment_reference: &str,
    ) -> Result<Invoice> {
        let lock = self.period_lock(tenant_id, period);
        let _guard = lock.lock().await;

        let mut invoice = self
            .invoices
            .get_for_period(tenant_id, period)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("invoice"))?;
        invoice.mark_paid(payment_reference, Utc::now())?;
        self.invoices.upsert(&invoice).await.map_err(Error::from)?;
        Ok(invoice)
    }

    pub async fn void(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
        reason: &str,
    ) -> Result<Invoice> {
        let lock = self.period_lock(tenant_id, period);
        let _guard = lock.lock().await;

        let mut invoice = self
            .invoices
            .get_for_period(tenant_id, period)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("invoice"))?;
        invoice.void(reason)?;
        self.invoices.upsert(&invoice).await.map_err(Error::from)?;
        Ok(invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use voxgate_core::{
        AuditKind, AuditOutcome, AuditRecord, AuditSeverity, TenantTier, UsageEvent,
    };
    use voxgate_store::{
        InMemoryAuditStore, InMemoryInvoiceStore, InMemoryTenantStore, InMemoryUsageLedger,
    };

    struct Fixture {
        builder: InvoiceBuilder,
        ledger: Arc<InMemoryUsageLedger>,
        tenant_id: String,
    }

    async fn fixture(discount_rate: f64) -> Fixture {
        let ledger = Arc::new(InMemoryUsageLedger::new(Arc::new(InMemoryAuditStore::new())));
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let tenants = Arc::new(InMemoryTenantStore::new());

        let mut tenant = Tenant::new("acme", "Acme", TenantTier::Professional).unwrap();
        tenant.discount_rate = discount_rate;
        let tenant_id = tenant.id.clone();
        tenants.upsert(&tenant).await.unwrap();

        Fixture {
            builder: InvoiceBuilder::new(ledger.clone(), invoices, tenants, 0.08),
            ledger,
            tenant_id,
        }
    }

    async fn seed_event(f: &Fixture, metric: UsageMetric, quantity: f64, cost: Decimal) {
        let event = UsageEvent::new(&f.tenant_id, metric, quantity, cost, serde_json::Value::Null);
        let audit = AuditRecord::new(
            &f.tenant_id,
            AuditKind::DataUpdate,
            AuditSeverity::Info,
            AuditOutcome::Success,
            "corr",
            "usage_recorded",
        );
        f.ledger.record(&event, &audit).await.unwrap();
    }

    #[tokio::test]
    async fn line_items_group_by_metric() {
        let f = fixture(0.0).await;
        seed_event(&f, UsageMetric::SynthesisChars, 75_000.0, Decimal::ZERO).await;
        seed_event(&f, UsageMetric::SynthesisChars, 25_000.0, dec!(11.25)).await;
        seed_event(&f, UsageMetric::SmsMessages, 10.0, dec!(0.075)).await;

        let period = BillingPeriod::current();
        let invoice = f.builder.materialize(&f.tenant_id, &period).await.unwrap();

        assert_eq!(invoice.line_items.len(), 2);
        let synth = invoice
            .line_items
            .iter()
            .find(|li| li.metric == UsageMetric::SynthesisChars)
            .unwrap();
        assert_eq!(synth.quantity, 100_000.0);
        assert_eq!(synth.amount, dec!(11.2500));
        assert_eq!(invoice.subtotal, dec!(11.3250));
        assert!(invoice.totals_consistent());
        assert!(invoice.number.starts_with(&format!("INV-{}-", period.0)));
    }

    #[tokio::test]
    async fn discount_and_tax_are_applied() {
        let f = fixture(0.10).await;
        seed_event(&f, UsageMetric::SynthesisChars, 1_000.0, dec!(100)).await;

        let invoice = f
            .builder
            .materialize(&f.tenant_id, &BillingPeriod::current())
            .await
            .unwrap();

        assert_eq!(invoice.subtotal, dec!(100.0000));
        assert_eq!(invoice.discount, dec!(10.0000));
        // Tax on the net: (100 - 10) * 0.08.
        assert_eq!(invoice.tax, dec!(7.2000));
        assert_eq!(invoice.total, dec!(97.2000));
    }

    #[tokio::test]
    async fn finalize_twice_returns_the_same_number() {
        let f = fixture(0.0).await;
        seed_event(&f, UsageMetric::ApiCalls, 100.0, dec!(1)).await;

        let period = BillingPeriod::current();
        let first = f.builder.finalize(&f.tenant_id, &period).await.unwrap();
        let second = f.builder.finalize(&f.tenant_id, &period).await.unwrap();

        assert_eq!(first.number, second.number);
        assert_eq!(second.status, InvoiceStatus::Sent);
        assert!(second.due_date.is_some());
    }

    #[tokio::test]
    async fn concurrent_materialization_yields_one_invoice() {
        let f = fixture(0.0).await;
        seed_event(&f, UsageMetric::ApiCalls, 100.0, dec!(1)).await;
        let period = BillingPeriod::current();

        let builder = f.builder.clone();
        let tenant = f.tenant_id.clone();
        let p = period.clone();
        let a = tokio::spawn(async move { builder.materialize(&tenant, &p).await.unwrap() });
        let b = f.builder.materialize(&f.tenant_id, &period).await.unwrap();
        let a = a.await.unwrap();

        assert_eq!(a.number, b.number);
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn mark_paid_is_idempotent() {
        let f = fixture(0.0).await;
        seed_event(&f, UsageMetric::ApiCalls, 100.0, dec!(1)).await;
        let period = BillingPeriod::current();

        f.builder.finalize(&f.tenant_id, &period).await.unwrap();
        let paid = f
            .builder
            .mark_paid(&f.tenant_id, &period, "pay_123")
            .await
            .unwrap();
        let again = f
            .builder
            .mark_paid(&f.tenant_id, &period, "pay_456")
            .await
            .unwrap();

        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(again.payment_reference.as_deref(), Some("pay_123"));
    }

    #[tokio::test]
    async fn sent_invoice_line_items_are_frozen() {
        let f = fixture(0.0).await;
        seed_event(&f, UsageMetric::ApiCalls, 100.0, dec!(1)).await;
        let period = BillingPeriod::current();
        let sent = f.builder.finalize(&f.tenant_id, &period).await.unwrap();

        // New events after finalization do not alter the invoice.
        seed_event(&f, UsageMetric::ApiCalls, 999.0, dec!(50)).await;
        let reloaded = f.builder.finalize(&f.tenant_id, &period).await.unwrap();
        assert_eq!(reloaded.subtotal, sent.subtotal);
        assert_eq!(reloaded.line_items[0].quantity, 100.0);
    }

    #[tokio::test]
    async fn empty_period_yields_zero_total() {
        let f = fixture(0.0).await;
        let invoice = f
            .builder
            .materialize(&f.tenant_id, &BillingPeriod("2023-06".into()))
            .await
            .unwrap();
        assert!(invoice.line_items.is_empty());
        assert_eq!(invoice.total, Decimal::ZERO);
    }
}
