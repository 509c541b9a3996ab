use axum::http::StatusCode;

/// Collapses a sqlx error into the (status, message) pair handlers return.
/// Constraint violations become client errors; everything else is a 500 with
/// the detail kept out of the response body.
pub fn map_db_error(err: sqlx::Error) -> (StatusCode, String) {
    let (status, message) = match &err {
        sqlx::Error::RowNotFound => (StatusCode::NOT_FOUND, "Not found"),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // unique_violation
            Some("23505") => (StatusCode::CONFLICT, "Already exists"),
            // foreign_key_violation, not_null_violation, invalid_text_representation
            Some("23503") | Some("23502") | Some("22P02") => {
                (StatusCode::BAD_REQUEST, "Invalid request")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
        },
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "database error");
    } else {
        tracing::warn!(error = %err, status = %status, "request rejected by database constraint");
    }
    (status, message.to_string())
}
