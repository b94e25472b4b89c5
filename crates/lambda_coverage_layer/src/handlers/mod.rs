pub mod combiner;
pub mod health;
