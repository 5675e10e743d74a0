pub mod booking_repository;
pub mod connection;
pub mod leases;
pub mod memory;
pub mod retreat_catalog;
