pub mod booking;
pub mod payment;
pub mod retreat;
pub mod user;
