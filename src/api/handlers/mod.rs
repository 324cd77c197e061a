pub mod cookies;
pub mod exchange;
pub mod health;
pub mod proxy;
