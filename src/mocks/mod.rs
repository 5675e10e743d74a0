//! In-process stand-ins for the payment gateway and the notifier. Only built
//! for tests and under the `test-support` feature.

pub mod notifier;
pub mod payment_gateway;

pub use notifier::RecordingNotifier;
pub use payment_gateway::MockPaymentGateway;
