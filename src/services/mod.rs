pub mod entitlement;
pub mod stripe;
