//! Concrete pipeline stages.
//!
//! Server side (in open order): authorization, file-descriptor
//! passthrough, interface bring-up, ACL programming, mechanism dispatch.
//! Client side: metadata propagation, mechanism translation, label
//! rewriting, cross-connect, file-descriptor passthrough, and the
//! terminal next-hop forwarder.

pub mod aclfilter;
pub mod authorize;
pub mod forward;
pub mod mechanisms;
pub mod meta;
pub mod passfd;
pub mod relabel;
pub mod translate;
pub mod up;
pub mod xconnect;
