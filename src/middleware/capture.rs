//! Response observation for access logging.

use http::StatusCode;

use crate::response::Response;

/// What a request produced, as seen from outside the handler.
///
/// Starts at `200 OK` with zero bytes, the values a client observes when a
/// handler finishes (or unwinds) without writing anything. [`record`]
/// replaces them with those of the final response; the response itself is
/// never modified.
///
/// [`record`]: ResponseCapture::record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseCapture {
    pub status: StatusCode,
    pub bytes_written: u64,
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self { status: StatusCode::OK, bytes_written: 0 }
    }

    pub fn record(&mut self, res: &Response) {
        self.status = res.status_code();
        self.bytes_written += res.body().len() as u64;
    }
}

impl Default for ResponseCapture {
    fn default() -> Self { Self::new() }
}
