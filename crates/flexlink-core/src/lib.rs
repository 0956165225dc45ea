//! flexlink-core: Core types, errors, events, and collaborator traits.
//!
//! This crate defines the shared vocabulary of the flexlink workspace.
//! Applications depend on these types without pulling in the protocol
//! engine or any network code.
//!
//! # Key types
//!
//! - [`Error`] / [`Result`] -- error handling across the workspace
//! - [`RadioEvent`] -- asynchronous state change notifications
//! - [`AudioBuffer`] / [`AudioReceiver`] -- audio delivery channel types
//! - [`DiscoveredRadio`], [`SliceMode`], [`EqType`] -- domain types
//! - [`TokenProvider`], [`CredentialStore`], [`AudioOutput`],
//!   [`NoiseReduction`] -- external collaborator interfaces

pub mod audio;
pub mod auth;
pub mod error;
pub mod events;
pub mod types;

// Re-export key types at crate root for ergonomic `use flexlink_core::*`.
pub use audio::{
    AudioBuffer, AudioOutput, AudioReceiver, AudioSender, NoiseReduction, Passthrough,
};
pub use auth::{CredentialScope, CredentialStore, TokenProvider};
pub use error::{Error, Result};
pub use events::RadioEvent;
pub use types::*;
