pub mod admin;
pub mod booking;
pub mod health;
pub mod payment;
