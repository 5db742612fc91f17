pub mod credential;
pub mod keys;
pub mod upstream;

pub use credential::{
    mask_token, CoolState, Credential, CredentialStatus, CredentialView, Mode, RequestState,
    UsageCounts,
};

pub mod auth;
pub mod telemetry;
