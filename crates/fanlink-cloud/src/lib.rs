//! Fanlink Cloud - Vendor cloud inventory client
//!
//! The vendor cloud is the source of truth for which appliances the account
//! owns. A listing is a two-step exchange:
//! 1. `POST /v1/userregistration/authenticate?country=..` trades the account
//!    email/password for an account id and API password
//! 2. `GET /v1/provisioningservice/manifest` (basic auth) lists the devices
//!    together with their local broker credentials

pub mod client;

pub use client::{ApiCredentials, CloudClient, CloudConfig, CloudDevice, CloudError, CloudInventory};
