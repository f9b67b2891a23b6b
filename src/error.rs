use std::io;

use http::StatusCode;
use n0_error::{AnyError, stack_error};
use tokio::io::AsyncWrite;

use crate::HttpResponse;

/// Error type for proxy-path failures.
///
/// Carries the HTTP status to surface to the client when a response can
/// still reasonably be sent. Proxy-path errors never kill the process;
/// they are written back as synthesised responses or logged when the
/// connection is past the point of replying.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        Self::io(value)
    }
}

impl ProxyError {
    /// The HTTP status code to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub(crate) fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    pub(crate) fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    pub(crate) fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }

    fn to_response(&self) -> Option<HttpResponse> {
        self.response_status().map(HttpResponse::new)
    }

    /// Writes the synthesised response for this error, when one applies.
    pub(crate) async fn write_response(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        match self.to_response() {
            Some(response) => response.write_head(writer).await,
            None => Ok(()),
        }
    }
}
