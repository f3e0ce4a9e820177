//! Billing for voxgate: invoice materialization and lifecycle.

pub mod invoice;

pub use invoice::InvoiceBuilder;
