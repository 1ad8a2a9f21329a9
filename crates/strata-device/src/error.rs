use std::fmt;

/// Error reported by the device layer.
///
/// No operation retries on its own. `Backend` failures are fatal to the
/// operation that raised them; callers are expected to abort rather than
/// recover partially completed GPU work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A bounded table or pool is full (device registry, descriptor pool).
    ResourceLimit(String),
    /// The caller broke an API contract: double map, unmap without map,
    /// unknown handle, cross-device misuse.
    Precondition(String),
    /// A native call failed (poll, map, fence wait).
    Backend(String),
    /// The capability exists in the contract but this backend has no path for it.
    Unsupported(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Self::ResourceLimit(msg.into())
    }

    /// Returns `true` for contract violations.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceLimit(msg) => write!(f, "resource limit reached: {msg}"),
            Self::Precondition(msg) => write!(f, "precondition violated: {msg}"),
            Self::Backend(msg) => write!(f, "backend call failed: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_category() {
        let e = DeviceError::resource_limit("256 devices");
        assert_eq!(e.to_string(), "resource limit reached: 256 devices");
        assert!(DeviceError::precondition("x").is_precondition());
        assert!(!DeviceError::backend("x").is_precondition());
    }
}
