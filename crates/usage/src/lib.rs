//! Usage accounting for voxgate: quota gates, tier pricing, the recorder,
//! and counter reconciliation.

pub mod cost;
pub mod quota;
pub mod reconcile;
pub mod recorder;

pub use cost::{CostBreakdown, CostCalculator};
pub use quota::{QuotaDecision, QuotaEvaluator, UsageSnapshot};
pub use reconcile::Reconciler;
pub use recorder::{CounterTtls, UsageReceipt, UsageRecorder, UsageRequest};
