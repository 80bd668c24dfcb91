//! Error handling and error classes
//!
//! Every fallible operation in this crate returns a [`Result`]. The [`ErrorKind`] of an [`Error`]
//! maps onto a stable integer error class so that a [`Status`](crate::point_to_point::Status) can
//! carry the outcome of a completed operation as a plain code, the same way a message passing
//! status does.
//!
//! Validation errors are reported synchronously by the call that detected them. Errors detected
//! by the transport while an operation is in flight are recorded in the completion status of the
//! request and only surface as an `Err` from the blocking `send`/`receive` calls or, as
//! [`ErrorKind::ErrorInStatus`], from the batch completion calls.

use thiserror::Error;

use crate::point_to_point::Status;

/// Error class of a successfully completed operation
pub const SUCCESS: i32 = 0;

macro_rules! build_error_kind {
    {
        $(#[$doc:meta])*
        pub enum $name:ident {
            $(
                 #[$err_doc:meta]
                 #[err($code:expr, $message:expr)]
                 $rust_err:ident,
            )*
        }
    } => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
            #[$err_doc]
            $rust_err,
            )*
        }

        impl $name {
            /// The integer error class recorded in a `Status`.
            pub fn code(self) -> i32 {
                match self {
                    $(
                    $name::$rust_err => $code,
                    )*
                }
            }

            /// Convert an integer error class back into an `ErrorKind`.
            ///
            /// Returns `None` for `SUCCESS` and for codes that do not name an error class.
            pub fn from_code(code: i32) -> Option<$name> {
                $(
                if code == $code {
                    return Some($name::$rust_err);
                }
                )*
                None
            }

            /// Short human readable description of the error class
            pub fn message(self) -> &'static str {
                match self {
                    $(
                    $name::$rust_err => $message,
                    )*
                }
            }
        }
    }
}

build_error_kind! {
    /// Set of error classes that can be reported by this crate.
    ///
    /// The numeric classes of the kinds shared with the message passing standard follow its
    /// numbering, the others are allocated above them.
    pub enum ErrorKind {
        /// Invalid count argument, e.g. a negative element count
        #[err(2, "invalid count argument")]
        InvalidCount,
        /// Invalid datatype argument
        #[err(3, "invalid datatype argument")]
        InvalidDatatype,
        /// Invalid tag argument
        #[err(4, "invalid tag argument")]
        InvalidTag,
        /// Invalid communicator argument
        #[err(5, "invalid communicator argument")]
        InvalidCommunicator,
        /// Invalid rank argument
        #[err(6, "invalid rank argument")]
        InvalidRank,
        /// Invalid request argument, e.g. a null or stale request handle
        #[err(7, "invalid request argument")]
        InvalidRequest,
        /// Invalid argument of some other kind
        #[err(13, "invalid argument")]
        InvalidArgument,
        /// Message truncated on receive or pack stream too short
        #[err(15, "message truncated")]
        MessageTruncated,
        /// Internal (implementation or transport) error
        #[err(17, "internal error")]
        Internal,
        /// Error code is in status
        #[err(18, "error code is in status")]
        ErrorInStatus,
        /// Invalid size argument
        #[err(20, "invalid size argument")]
        InvalidSize,
        /// The datatype has not been committed
        #[err(32, "datatype has not been committed")]
        UncommittedType,
        /// Predefined datatypes cannot be freed while the runtime is initialized
        #[err(33, "cannot free a predefined datatype")]
        CannotFreePermanent,
        /// A buffered-send region is already attached
        #[err(34, "a buffer is already attached")]
        BufferAlreadyExists,
        /// The attached buffered-send region has no room for the message
        #[err(35, "buffered-send region exhausted")]
        BufferExhausted,
        /// The persistent request is already active
        #[err(36, "request is already active")]
        RequestAlreadyActive,
        /// The operation of the request has already completed
        #[err(37, "request has already completed")]
        RequestAlreadyComplete,
        /// The runtime has not been initialized
        #[err(38, "runtime is not initialized")]
        NotInitialized,
        /// The runtime has already been finalized
        #[err(39, "runtime has already been finalized")]
        AlreadyFinalized,
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// An error reported by this crate
///
/// Carries the [`ErrorKind`], a message and, for [`ErrorKind::ErrorInStatus`], the statuses of
/// the operations of a batch call together with their position in the batch.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    statuses: Vec<(usize, Status)>,
}

impl Error {
    /// An error of class `kind` without further detail.
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            message: kind.message().to_owned(),
            statuses: Vec::new(),
        }
    }

    /// An error of class `kind` with a detail message.
    pub fn with_detail<D: std::fmt::Display>(kind: ErrorKind, detail: D) -> Error {
        Error {
            kind,
            message: format!("{}: {}", kind.message(), detail),
            statuses: Vec::new(),
        }
    }

    /// An `ErrorInStatus` error carrying the statuses of a batch.
    pub fn in_status(statuses: Vec<(usize, Status)>) -> Error {
        let failed = statuses
            .iter()
            .filter(|(_, status)| status.error().is_some())
            .count();
        Error {
            kind: ErrorKind::ErrorInStatus,
            message: format!(
                "{}: {} of {} operations failed",
                ErrorKind::ErrorInStatus.message(),
                failed,
                statuses.len()
            ),
            statuses,
        }
    }

    /// The error class
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Statuses of the operations of a batch, as `(index, status)` pairs.
    ///
    /// Empty unless the kind is `ErrorInStatus` or the error was raised by a blocking call from a
    /// completion status.
    pub fn statuses(&self) -> &[(usize, Status)] {
        &self.statuses
    }

    /// Attach the status the error was taken from.
    pub(crate) fn from_status(kind: ErrorKind, status: Status) -> Error {
        Error {
            kind,
            message: kind.message().to_owned(),
            statuses: vec![(0, status)],
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

/// Result type of the fallible operations of this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for kind in [
            ErrorKind::InvalidCount,
            ErrorKind::MessageTruncated,
            ErrorKind::ErrorInStatus,
            ErrorKind::BufferExhausted,
            ErrorKind::AlreadyFinalized,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(SUCCESS), None);
        assert_eq!(ErrorKind::from_code(-5), None);
    }

    #[test]
    fn detail_is_part_of_message() {
        let err = Error::with_detail(ErrorKind::InvalidArgument, "dimension 2");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "invalid argument: dimension 2");
        assert!(err.statuses().is_empty());
    }

    #[test]
    fn in_status_counts_failures() {
        let ok = Status::empty();
        let bad = Status::from_error(ErrorKind::Internal);
        let err = Error::in_status(vec![(0, ok), (1, bad), (2, ok)]);
        assert_eq!(err.kind(), ErrorKind::ErrorInStatus);
        assert_eq!(err.statuses().len(), 3);
        assert!(err.to_string().contains("1 of 3"));
    }
}
