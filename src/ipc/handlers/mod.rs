pub mod analytics;
pub mod attempts;
pub mod catalog;
pub mod core;
pub mod entitlements;
pub mod roster;
