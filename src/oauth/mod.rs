//! AWS SSO OIDC device-code driver and the loopback landing
//! server that drives it interactively.

pub mod device_code;
pub mod landing_server;

pub use device_code::{begin_authorization, poll_for_token, AuthorizationChallenge, TokenResult};
pub use landing_server::{AuthorizationStatus, LandingHandle, LandingServer};
