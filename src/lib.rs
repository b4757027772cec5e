//! vmcloak library
//!
//! Provision disposable analysis VMs with randomized, internally consistent
//! hardware identities and an unattended OS install.

pub mod backend;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod pipeline;
pub mod rendezvous;
pub mod validation;
