//! # childsa
//!
//! The CHILD_SA negotiation engine of an IKEv2 daemon: it drives the
//! IKE_AUTH piggyback, CREATE_CHILD_SA and IKE_FOLLOWUP_KE exchanges,
//! narrows traffic selectors against local policy, runs the negotiated
//! key exchanges and installs the resulting SA pair into a kernel IPsec
//! backend

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod bus;
pub mod child_sa;
pub mod config;
pub mod host;
pub mod ikesa;
pub mod kernel;
pub mod keyexchange;
pub mod keymat;
pub mod label;
pub mod sched;
pub mod selector;
pub mod tasks;

pub use crate::tasks::child_create::ChildCreate;
pub use crate::tasks::Task;
pub use crate::tasks::TaskStatus;
