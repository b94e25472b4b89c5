pub mod context;
pub mod reports;
pub mod stores;
