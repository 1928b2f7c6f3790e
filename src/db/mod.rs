pub mod audit;
pub mod entities;
pub mod reversals;
pub mod snapshots;
pub mod spans;
