//! Backend error classification.
//!
//! [`classify`] maps a [`BackendError`] into a [`ClassifiedError`]. The
//! mapping is pure and table-driven by [`ErrorCode`]:
//!
//! | Codes | Retry | Backoff | Suppress |
//! |-------|-------|---------|----------|
//! | not-found / already-exists / in-use / conditional check / idempotency / transaction in progress or conflict | no | - | no |
//! | transaction cancelled (flags a conditional-check conflict when the message says so) | no | - | no |
//! | item collection size limit, limit exceeded | yes | long | no |
//! | provisioned throughput, request limit | yes | long | yes |
//! | internal server error | yes | short | yes |
//! | anything else, transport failures | no | - | no |

use crate::error::{BackendError, ClassifiedError, ErrorCode, ErrorKind, GatewayResult};

/// Marker the backend puts in a cancelled transaction's reasons when one of
/// its conditions failed.
const CONDITIONAL_CHECK_MARKER: &str = "ConditionalCheckFailed";

/// Classifies `err`, prefixing the message with `prefix` when given.
#[must_use]
pub fn classify(err: &BackendError, prefix: Option<&str>) -> ClassifiedError {
    let message = match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix} {err}"),
        _ => err.to_string(),
    };

    let (code, service_message) = match err {
        BackendError::Service { code, message } => (code, message),
        BackendError::Transport(_) => {
            return ClassifiedError::new(ErrorKind::Transport, message, false, false, false);
        },
    };

    let kind = ErrorKind::Backend(code.clone());
    match code {
        ErrorCode::ResourceNotFound
        | ErrorCode::ResourceInUse
        | ErrorCode::TableNotFound
        | ErrorCode::TableAlreadyExists
        | ErrorCode::IndexNotFound
        | ErrorCode::ConditionalCheckFailed
        | ErrorCode::IdempotentParameterMismatch
        | ErrorCode::TransactionInProgress
        | ErrorCode::TransactionConflict => ClassifiedError::new(kind, message, false, false, false),

        ErrorCode::TransactionCanceled => {
            let classified = ClassifiedError::new(kind, message, false, false, false);
            if service_message.contains(CONDITIONAL_CHECK_MARKER) {
                classified.with_conditional_check_failed()
            } else {
                classified
            }
        },

        ErrorCode::ItemCollectionSizeLimitExceeded | ErrorCode::LimitExceeded => {
            ClassifiedError::new(kind, message, true, true, false)
        },

        ErrorCode::ProvisionedThroughputExceeded | ErrorCode::RequestLimitExceeded => {
            ClassifiedError::new(kind, message, true, true, true)
        },

        ErrorCode::InternalServerError => ClassifiedError::new(kind, message, true, false, true),

        ErrorCode::Validation | ErrorCode::Other(_) => {
            ClassifiedError::new(kind, message, false, false, false)
        },
    }
}

/// Classifies the error side of a backend result. `Ok` passes through: a
/// successful call has no classification.
pub fn classify_result<T>(
    result: Result<T, BackendError>,
    prefix: Option<&str>,
) -> GatewayResult<T> {
    result.map_err(|err| classify(&err, prefix))
}
