pub mod auth;
pub mod features;
pub mod stripe;
pub mod subscription;
pub mod tokens;
