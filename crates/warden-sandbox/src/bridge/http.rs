//! `http_fetch`

use super::HostBridge;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::output::LimitedBuffer;
use crate::policy::Capability;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use tracing::{debug, instrument};

/// Status and capped body of an HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body, at most `max_output_bytes` long
    pub body: Vec<u8>,
}

impl HostBridge {
    /// Issue an HTTP request to an allowed host
    ///
    /// The request runs under the policy timeout and `deadline`, whichever
    /// comes first. The body is read until `max_output_bytes`; the rest is
    /// never downloaded.
    #[instrument(skip(self, body, headers, deadline), fields(method = %method))]
    pub async fn http_fetch(
        &self,
        method: &str,
        url: &str,
        body: Option<Vec<u8>>,
        headers: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<HttpResponse> {
        self.check_capability(Capability::NetHttp, "http_fetch")?;
        self.validate_url(url)?;

        let method = if method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| Error::runtime_with(format!("invalid http method {method:?}"), e))?
        };

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::runtime_with(format!("invalid header name {name:?}"), e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::runtime_with("invalid header value", e))?;
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let deadline = deadline.tighten(self.policy.timeout());
        let limit = self.policy.max_output_bytes();
        let timeout = self.policy.timeout();

        let exchange = async {
            let mut response = request.send().await.map_err(|e| classify(e, timeout))?;
            let status = response.status().as_u16();
            let mut sink = LimitedBuffer::new(limit);
            while !sink.is_full() {
                match response.chunk().await.map_err(|e| classify(e, timeout))? {
                    Some(chunk) => {
                        sink.push(&chunk);
                    }
                    None => break,
                }
            }
            Ok::<_, Error>(HttpResponse {
                status,
                body: sink.into_inner(),
            })
        };

        let response = deadline
            .run(exchange)
            .await
            .map_err(|_| Error::timeout(deadline.timeout()))??;

        debug!(status = response.status, body_len = response.body.len(), "http_fetch");
        Ok(response)
    }
}

fn classify(err: reqwest::Error, timeout: std::time::Duration) -> Error {
    if err.is_timeout() {
        return Error::timeout(timeout);
    }
    Error::runtime_with("http request failed", err)
}
