//! Obtain a certificate for a hosting account's domains from an ACME CA in a
//! single run: register, prove control over HTTP-01, issue, hand off.

pub mod challenge;
pub mod core;
pub mod distribution;
pub mod domain;
pub mod issuance;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::core::options::{IssuanceOptions, PollingConfig};
pub use crate::core::types::{IssuedCertificate, RunFailure, RunReport, RunResult};
pub use crate::domain::DomainSet;
pub use crate::issuance::flow::IssuanceOrchestrator;
