//! Webhook fan-out for voxgate.

pub mod canonical;
pub mod dispatcher;

pub use canonical::{canonical_json, sign, verify};
pub use dispatcher::{
    AttemptOutcome, DeliveryTransport, DispatcherConfig, HttpTransport, PlainSecrets,
    SecretCipher, WebhookDispatcher,
};
