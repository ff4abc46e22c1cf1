use std::borrow::Cow;

use prometheus::IntCounter;

mod metrics;

/// Classification attached to an `anyhow::Error` with `.context(..)`.
///
/// `short_msg` is a stable CamelCase tag that tests and metrics match on;
/// `msg` is the operator facing explanation and may be reworded freely.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// e.g. `IndexBuildInProgress`
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,

    /// An identical index already exists on the table.
    DuplicateDefinition,
    /// The operation isn't legal in the index's current phase.
    InvalidIndexState,
    /// A build scan or validation failed. The index is left invalid.
    BuildAborted,
    /// The snapshot/transaction oracle couldn't be reached. Retryable.
    OracleUnavailable,
}

macro_rules! classified_constructors {
    ($($(#[$doc:meta])* $ctor:ident / $is:ident => $code:ident,)*) => {
        impl ErrorMetadata {
            $(
                $(#[$doc])*
                pub fn $ctor(
                    short_msg: impl Into<Cow<'static, str>>,
                    msg: impl Into<Cow<'static, str>>,
                ) -> Self {
                    Self {
                        code: ErrorCode::$code,
                        short_msg: short_msg.into(),
                        msg: msg.into(),
                    }
                }

                pub fn $is(&self) -> bool {
                    self.code == ErrorCode::$code
                }
            )*
        }

        /// Classification queries on an `anyhow::Error`. They look at the
        /// outermost `ErrorMetadata` in the chain.
        pub trait ErrorMetadataAnyhowExt {
            $(fn $is(&self) -> bool;)*
            fn is_oracle_unavailable(&self) -> bool;
            fn is_retryable(&self) -> bool;
            fn short_msg(&self) -> &str;
            fn msg(&self) -> &str;
            fn error_code(&self) -> Option<ErrorCode>;
            /// Rewrite the operator facing message while keeping the code and
            /// short_msg of an attached `ErrorMetadata`.
            fn wrap_error_message<F>(self, f: F) -> Self
            where
                F: FnOnce(String) -> String;
        }

        impl ErrorMetadataAnyhowExt for anyhow::Error {
            $(
                fn $is(&self) -> bool {
                    metadata(self).is_some_and(ErrorMetadata::$is)
                }
            )*

            fn is_oracle_unavailable(&self) -> bool {
                metadata(self).is_some_and(ErrorMetadata::is_oracle_unavailable)
            }

            fn is_retryable(&self) -> bool {
                metadata(self).is_some_and(ErrorMetadata::is_retryable)
            }

            fn short_msg(&self) -> &str {
                metadata(self).map_or(INTERNAL_ERROR, |e| &*e.short_msg)
            }

            fn msg(&self) -> &str {
                metadata(self).map_or(INTERNAL_ERROR_MSG, |e| &*e.msg)
            }

            fn error_code(&self) -> Option<ErrorCode> {
                metadata(self).map(|e| e.code)
            }

            fn wrap_error_message<F>(self, f: F) -> Self
            where
                F: FnOnce(String) -> String,
            {
                match metadata(&self).cloned() {
                    Some(mut em) => {
                        em.msg = f(em.msg.into_owned()).into();
                        self.context(em)
                    },
                    None => {
                        let msg = f(self.to_string());
                        self.context(msg)
                    },
                }
            }
        }
    };
}

classified_constructors! {
    /// Malformed request, e.g. an index definition that fails validation.
    bad_request / is_bad_request => BadRequest,
    not_found / is_not_found => NotFound,
    duplicate_definition / is_duplicate_definition => DuplicateDefinition,
    invalid_index_state / is_invalid_index_state => InvalidIndexState,
    /// The build failed on its content (e.g. a duplicate key for a unique
    /// index) or was canceled.
    build_aborted / is_build_aborted => BuildAborted,
}

fn metadata(e: &anyhow::Error) -> Option<&ErrorMetadata> {
    e.downcast_ref::<ErrorMetadata>()
}

impl ErrorMetadata {
    /// Transient failure talking to the transaction oracle.
    pub fn oracle_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::OracleUnavailable,
            short_msg: ORACLE_UNAVAILABLE.into(),
            msg: msg.into(),
        }
    }

    pub fn is_oracle_unavailable(&self) -> bool {
        self.code == ErrorCode::OracleUnavailable
    }

    /// Retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::OracleUnavailable)
    }

    /// The caller caused this error, as opposed to the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::BadRequest
                | ErrorCode::NotFound
                | ErrorCode::DuplicateDefinition
                | ErrorCode::InvalidIndexState
        )
    }

    pub fn custom_metric(&self) -> &'static IntCounter {
        use crate::metrics::*;
        match self.code {
            ErrorCode::BadRequest => &BAD_REQUEST_ERROR_TOTAL,
            ErrorCode::NotFound => &NOT_FOUND_ERROR_TOTAL,
            ErrorCode::DuplicateDefinition => &DUPLICATE_DEFINITION_ERROR_TOTAL,
            ErrorCode::InvalidIndexState => &INVALID_INDEX_STATE_ERROR_TOTAL,
            ErrorCode::BuildAborted => &BUILD_ABORTED_ERROR_TOTAL,
            ErrorCode::OracleUnavailable => &ORACLE_UNAVAILABLE_ERROR_TOTAL,
        }
    }

    /// The `tracing` level an error of this kind is reported at.
    pub fn report_level(&self) -> tracing::Level {
        if self.is_caller_error() {
            tracing::Level::INFO
        } else if self.is_retryable() {
            tracing::Level::WARN
        } else {
            tracing::Level::ERROR
        }
    }
}

pub const INTERNAL_ERROR_MSG: &str = "The operation couldn't be completed. Try again later.";
pub const INTERNAL_ERROR: &str = "InternalError";
pub const ORACLE_UNAVAILABLE: &str = "OracleUnavailable";

#[cfg(any(test, feature = "testing"))]
mod arbitrary_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("Bad", "request"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("Not", "found"),
                    ErrorCode::DuplicateDefinition => {
                        ErrorMetadata::duplicate_definition("Duplicate", "definition")
                    },
                    ErrorCode::InvalidIndexState => {
                        ErrorMetadata::invalid_index_state("Invalid", "state")
                    },
                    ErrorCode::BuildAborted => ErrorMetadata::build_aborted("Build", "aborted"),
                    ErrorCode::OracleUnavailable => ErrorMetadata::oracle_unavailable("down"),
                })
                .boxed()
        }
    }
}
