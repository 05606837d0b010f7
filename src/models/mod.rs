pub mod entitlement;
pub mod feature;
pub mod plan;
pub mod subscription;
