/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Error taxonomy shared by every communication manager subsystem.
//!
//! Variant names are the error *kinds* from the component design, not
//! subsystem-specific types: a `NotFound` raised by the balancer and one
//! raised by the node info cache carry the same variant, distinguished by
//! their message and `source`.

use std::panic::Location;

/// The single error type returned by every public operation in this
/// workspace's `cm-*` crates.
#[derive(Debug, thiserror::Error)]
pub enum CmError {
    /// A named entity is absent (node, instance, service, mount point, URL
    /// scheme, label).
    #[error("not found: {message}")]
    NotFound {
        message: String,
        location: &'static Location<'static>,
    },

    /// An operation was attempted in an incompatible state (double
    /// start/stop, update while already updating).
    #[error("wrong state: {message}")]
    WrongState {
        message: String,
        location: &'static Location<'static>,
    },

    /// Malformed input (bad path, bad algorithm name, wrong length).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        message: String,
        location: &'static Location<'static>,
    },

    /// Content hash does not match the expected value.
    #[error("invalid checksum: {message}")]
    InvalidChecksum {
        message: String,
        location: &'static Location<'static>,
    },

    /// A bounded container is full, or a per-instance quota cannot satisfy
    /// the request.
    #[error("no memory: {message}")]
    NoMemory {
        message: String,
        location: &'static Location<'static>,
    },

    /// A bounded wait expired (SM connection, status).
    #[error("timeout: {message}")]
    Timeout {
        message: String,
        location: &'static Location<'static>,
    },

    /// An in-flight operation was aborted by an explicit `Cancel` or by
    /// shutdown.
    #[error("canceled: {message}")]
    Canceled {
        message: String,
        location: &'static Location<'static>,
    },

    /// Generic downstream failure from a collaborator; the original cause is
    /// preserved in the error chain.
    #[error("failed: {message}")]
    Failed {
        message: String,
        location: &'static Location<'static>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CmError {
    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::WrongState {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn invalid_checksum(message: impl Into<String>) -> Self {
        Self::InvalidChecksum {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn no_memory(message: impl Into<String>) -> Self {
        Self::NoMemory {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::Canceled {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            location: Location::caller(),
            source: None,
        }
    }

    #[track_caller]
    pub fn failed_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            location: Location::caller(),
            source: Some(Box::new(source)),
        }
    }

    /// The call site that raised this error, for structured log fields.
    pub fn location(&self) -> &'static Location<'static> {
        match self {
            Self::NotFound { location, .. }
            | Self::WrongState { location, .. }
            | Self::InvalidArgument { location, .. }
            | Self::InvalidChecksum { location, .. }
            | Self::NoMemory { location, .. }
            | Self::Timeout { location, .. }
            | Self::Canceled { location, .. }
            | Self::Failed { location, .. } => location,
        }
    }
}

pub type CmResult<T> = Result<T, CmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_caller_location() {
        let err = CmError::not_found("no nodes with instance labels");
        assert!(matches!(err, CmError::NotFound { .. }));
        assert_eq!(err.location().file(), file!());
    }
}
