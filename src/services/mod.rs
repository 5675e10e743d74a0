pub mod availability;
pub mod booking_service;
pub mod email_service;
pub mod reconciliation_service;
pub mod receipt;
pub mod scheduler;
pub mod stripe_service;
