pub mod audit_steps;
pub mod memories;
