//! Error codes and chained error information.
//!
//! Every callback boundary in the engine speaks the reserved return-code
//! taxonomy ([`ErrorCode`]). Failures accumulate into an ordered
//! [`ErrorInfo`] chain (code + optional path + message per entry) that is
//! attached to the originating session by the embedding layer. Chains from
//! independent subscribers of one operation are merged in fan-out order.

use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Reserved return codes used on the callback boundary and in error chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Operation succeeded.
    Ok,
    /// Invalid argument supplied by the caller.
    InvalidArgument,
    /// Requested item does not exist.
    NotFound,
    /// Operation is not supported by the receiving subscriber.
    Unsupported,
    /// Engine-internal fault.
    Internal,
    /// Memory or queue capacity exhausted.
    NoMemory,
    /// Data failed schema validation.
    Validation,
    /// A subscriber reported the operation failed.
    OperationFailed,
    /// A deadline elapsed before completion.
    Timeout,
    /// Internal re-queue signal; never surfaced in an error chain.
    CallbackShelve,
    /// A required lock is held elsewhere.
    Locked,
    /// Operating-system level failure.
    System,
}

impl ErrorCode {
    /// Returns `true` for codes that represent a failure.
    ///
    /// `Ok` and `CallbackShelve` are not failures; shelve is a re-queue
    /// signal handled entirely inside the pump.
    #[must_use]
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Ok | Self::CallbackShelve)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal error",
            Self::NoMemory => "out of memory",
            Self::Validation => "validation failed",
            Self::OperationFailed => "operation failed",
            Self::Timeout => "timeout",
            Self::CallbackShelve => "callback shelve",
            Self::Locked => "locked",
            Self::System => "system error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorItem
// ---------------------------------------------------------------------------

/// One entry of an error chain: a code, an optional data path, a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorItem {
    /// Failure code.
    pub code: ErrorCode,
    /// Path of the node the error concerns, when known.
    pub xpath: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl ErrorItem {
    /// Creates an item without a path.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            xpath: None,
            message: message.into(),
        }
    }

    /// Creates an item tied to a data path.
    #[must_use]
    pub fn with_path(code: ErrorCode, xpath: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            xpath: Some(xpath.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.xpath {
            Some(path) => write!(f, "{}: {} ({})", self.code, self.message, path),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// Ordered chain of [`ErrorItem`]s describing one failed operation.
///
/// The first item is the primary failure; later items add context from
/// other subscribers or engine layers. An empty chain means success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    items: Vec<ErrorItem>,
}

impl ErrorInfo {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain from a single item.
    #[must_use]
    pub fn from_item(item: ErrorItem) -> Self {
        Self { items: vec![item] }
    }

    /// Appends an item to the chain.
    pub fn push(&mut self, item: ErrorItem) {
        debug_assert!(item.code != ErrorCode::CallbackShelve);
        self.items.push(item);
    }

    /// Merges another chain into this one. The merged chain is appended
    /// after the existing items, preserving the order failures occurred.
    pub fn merge(&mut self, other: ErrorInfo) {
        self.items.extend(other.items);
    }

    /// Returns `true` if no failure has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the code of the primary (first) failure, or `Ok` for an
    /// empty chain.
    #[must_use]
    pub fn first_code(&self) -> ErrorCode {
        self.items.first().map_or(ErrorCode::Ok, |i| i.code)
    }

    /// Returns the chain entries in order.
    #[must_use]
    pub fn items(&self) -> &[ErrorItem] {
        &self.items
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.items.is_empty() {
            return f.write_str("no error");
        }
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_failure_classification() {
        assert!(!ErrorCode::Ok.is_failure());
        assert!(!ErrorCode::CallbackShelve.is_failure());
        assert!(ErrorCode::OperationFailed.is_failure());
        assert!(ErrorCode::Timeout.is_failure());
        assert!(ErrorCode::Validation.is_failure());
    }

    #[test]
    fn test_chain_push_and_first() {
        let mut info = ErrorInfo::new();
        assert!(info.is_empty());
        assert_eq!(info.first_code(), ErrorCode::Ok);

        info.push(ErrorItem::with_path(
            ErrorCode::OperationFailed,
            "/m:x/v",
            "subscriber rejected the change",
        ));
        info.push(ErrorItem::new(ErrorCode::Internal, "peer abort failed"));

        assert!(!info.is_empty());
        assert_eq!(info.first_code(), ErrorCode::OperationFailed);
        assert_eq!(info.items().len(), 2);
        assert_eq!(info.items()[0].xpath.as_deref(), Some("/m:x/v"));
    }

    #[test]
    fn test_chain_merge_preserves_order() {
        let mut a = ErrorInfo::from_item(ErrorItem::new(ErrorCode::Timeout, "first"));
        let b = ErrorInfo::from_item(ErrorItem::new(ErrorCode::Internal, "second"));
        a.merge(b);

        assert_eq!(a.items().len(), 2);
        assert_eq!(a.items()[0].message, "first");
        assert_eq!(a.items()[1].message, "second");
        assert_eq!(a.first_code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_display() {
        let item = ErrorItem::with_path(ErrorCode::Validation, "/m:c", "bad leaf");
        assert_eq!(format!("{item}"), "validation failed: bad leaf (/m:c)");

        let mut info = ErrorInfo::new();
        assert_eq!(format!("{info}"), "no error");
        info.push(item);
        info.push(ErrorItem::new(ErrorCode::Timeout, "late"));
        assert_eq!(
            format!("{info}"),
            "validation failed: bad leaf (/m:c); timeout: late"
        );
    }
}
