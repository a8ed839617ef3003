use reqwest::StatusCode;

use crate::webdav::RemoteEntry;

/// Outcome classification shared by every remote operation. Transport
/// failures, HTTP error statuses and local aborts all collapse into one
/// of these codes before a result leaves the operation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Unauthorized,
    FileNotFound,
    Conflict,
    SyncConflict,
    SslError,
    SslRecoverablePeerUnverified,
    BadServerVersion,
    InstanceNotConfigured,
    AccountNotFound,
    AccountException,
    ServiceUnavailable,
    QuotaExceeded,
    LocalStorageFull,
    Timeout,
    HostNotAvailable,
    WrongConnection,
    TooManyRedirects,
    Cancelled,
    UnknownError,
}

impl ResultCode {
    /// Codes that make the whole account unusable. A sync pass stops
    /// contacting the server once one of these shows up.
    pub fn is_account_fatal(self) -> bool {
        matches!(
            self,
            ResultCode::SslError
                | ResultCode::SslRecoverablePeerUnverified
                | ResultCode::BadServerVersion
                | ResultCode::InstanceNotConfigured
                | ResultCode::AccountNotFound
                | ResultCode::AccountException
        )
    }
}

#[derive(Debug, Clone)]
pub enum ResultPayload {
    Entries(Vec<RemoteEntry>),
}

/// Immutable outcome of one remote operation.
#[derive(Debug, Clone)]
pub struct RemoteOperationResult {
    pub code: ResultCode,
    pub http_status: Option<u16>,
    pub redirected_location: Option<String>,
    pub error: Option<String>,
    pub payload: Option<ResultPayload>,
}

impl RemoteOperationResult {
    pub fn ok() -> Self {
        Self::from_code(ResultCode::Ok)
    }

    pub fn cancelled() -> Self {
        Self::from_code(ResultCode::Cancelled)
    }

    pub fn from_code(code: ResultCode) -> Self {
        Self {
            code,
            http_status: None,
            redirected_location: None,
            error: None,
            payload: None,
        }
    }

    pub fn from_http_status(status: StatusCode) -> Self {
        Self {
            code: classify_http_status(status),
            http_status: Some(status.as_u16()),
            redirected_location: None,
            error: None,
            payload: None,
        }
    }

    pub fn from_transport_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            code: classify_transport_error(error),
            http_status: None,
            redirected_location: None,
            error: Some(error.to_string()),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: ResultPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_redirected_location(mut self, location: impl Into<String>) -> Self {
        self.redirected_location = Some(location.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Ok
    }

    pub fn entries(&self) -> Option<&[RemoteEntry]> {
        match &self.payload {
            Some(ResultPayload::Entries(entries)) => Some(entries),
            None => None,
        }
    }
}

fn classify_http_status(status: StatusCode) -> ResultCode {
    if status.is_success() {
        return ResultCode::Ok;
    }
    if status.is_redirection() {
        return ResultCode::TooManyRedirects;
    }
    match status {
        StatusCode::UNAUTHORIZED => ResultCode::Unauthorized,
        StatusCode::NOT_FOUND => ResultCode::FileNotFound,
        StatusCode::CONFLICT => ResultCode::Conflict,
        StatusCode::SERVICE_UNAVAILABLE => ResultCode::ServiceUnavailable,
        StatusCode::INSUFFICIENT_STORAGE => ResultCode::QuotaExceeded,
        _ => ResultCode::UnknownError,
    }
}

fn classify_transport_error(error: &(dyn std::error::Error + 'static)) -> ResultCode {
    if let Some(request_error) = find_reqwest_error(error) {
        if request_error.is_timeout() {
            return ResultCode::Timeout;
        }
        if request_error.is_connect() {
            // TLS handshake problems surface as connect errors; sniff the
            // source chain to keep certificate failures distinguishable.
            if chain_mentions_tls(request_error) {
                return ResultCode::SslError;
            }
            return ResultCode::HostNotAvailable;
        }
        return ResultCode::WrongConnection;
    }
    ResultCode::UnknownError
}

fn find_reqwest_error<'a>(
    error: &'a (dyn std::error::Error + 'static),
) -> Option<&'a reqwest::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(request_error) = err.downcast_ref::<reqwest::Error>() {
            return Some(request_error);
        }
        current = err.source();
    }
    None
}

fn chain_mentions_tls(error: &dyn std::error::Error) -> bool {
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_to_codes() {
        assert_eq!(
            RemoteOperationResult::from_http_status(StatusCode::MULTI_STATUS).code,
            ResultCode::Ok
        );
        assert_eq!(
            RemoteOperationResult::from_http_status(StatusCode::UNAUTHORIZED).code,
            ResultCode::Unauthorized
        );
        assert_eq!(
            RemoteOperationResult::from_http_status(StatusCode::NOT_FOUND).code,
            ResultCode::FileNotFound
        );
        assert_eq!(
            RemoteOperationResult::from_http_status(StatusCode::MOVED_PERMANENTLY).code,
            ResultCode::TooManyRedirects
        );
        assert_eq!(
            RemoteOperationResult::from_http_status(StatusCode::INSUFFICIENT_STORAGE).code,
            ResultCode::QuotaExceeded
        );
    }

    #[derive(Debug, thiserror::Error)]
    #[error("operation failed: {0}")]
    struct WrappedTransport(#[from] reqwest::Error);

    #[tokio::test]
    async fn transport_errors_are_classified_through_the_source_chain() {
        // Nothing listens on port 1, so the connect fails locally.
        let error = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();

        let direct = RemoteOperationResult::from_transport_error(&error);
        assert_eq!(direct.code, ResultCode::HostNotAvailable);

        let wrapped = WrappedTransport(error);
        let through_chain = RemoteOperationResult::from_transport_error(&wrapped);
        assert_eq!(through_chain.code, ResultCode::HostNotAvailable);
        assert!(through_chain.error.is_some());
    }

    #[test]
    fn account_fatal_codes_are_exactly_the_listed_ones() {
        let fatal = [
            ResultCode::SslError,
            ResultCode::SslRecoverablePeerUnverified,
            ResultCode::BadServerVersion,
            ResultCode::InstanceNotConfigured,
            ResultCode::AccountNotFound,
            ResultCode::AccountException,
        ];
        for code in fatal {
            assert!(code.is_account_fatal(), "{code:?} should be fatal");
        }
        for code in [
            ResultCode::Ok,
            ResultCode::Unauthorized,
            ResultCode::FileNotFound,
            ResultCode::Timeout,
            ResultCode::ServiceUnavailable,
            ResultCode::Cancelled,
        ] {
            assert!(!code.is_account_fatal(), "{code:?} should not be fatal");
        }
    }
}
