//! Policy errors.

use cellbox_types::{DescriptorError, UnknownCapability};

/// Registration-time policy failures.
///
/// Runtime checks never produce errors: `check` answers `false` instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The manifest named a permission outside the host vocabulary.
    #[error(transparent)]
    UnknownCapability(#[from] UnknownCapability),

    /// The descriptor violated a structural invariant.
    #[error(transparent)]
    InvalidDescriptor(#[from] DescriptorError),
}
