pub mod health;
pub mod payment;
