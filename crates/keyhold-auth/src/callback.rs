//! Loopback listener for the redirect flow.
//!
//! After the user approves in the browser, the authorization server
//! redirects to `redirect_uri` with `?code=xxx&state=yyy`. [`CallbackServer`]
//! binds the loopback port of that URI before the browser is opened, accepts
//! exactly one request, answers with a short page and hands back the
//! parameters.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{AuthError, Result};

/// Page returned to the browser once the code has been captured.
const SUCCESS_HTML: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>keyhold</title></head><body><h1>Signed in</h1>\
<p>You can close this tab and return to your terminal.</p></body></html>";

/// Page returned when the redirect carried an error.
const FAILURE_HTML: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>keyhold</title></head><body><h1>Sign-in failed</h1>\
<p>Return to your terminal for details.</p></body></html>";

/// Parameters captured from the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// A bound single-use callback listener.
pub struct CallbackServer {
    listener: TcpListener,
}

impl CallbackServer {
    /// Bind `127.0.0.1:{port}`. Port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            "callback server listening for authorization redirect"
        );
        Ok(Self { listener })
    }

    /// The port actually bound.
    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Wait for the redirect.
    ///
    /// # Errors
    ///
    /// - [`AuthError::CallbackTimeout`] if nothing arrives within `timeout`.
    /// - [`AuthError::AuthenticationFailed`] if the redirect carries an
    ///   `error` or lacks `code`/`state`.
    pub async fn wait(self, timeout: Duration) -> Result<CallbackParams> {
        match tokio::time::timeout(timeout, Self::accept_one(&self.listener)).await {
            Ok(inner) => inner,
            Err(_) => Err(AuthError::CallbackTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    async fn accept_one(listener: &TcpListener) -> Result<CallbackParams> {
        let (mut stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "redirect connection accepted");

        // A browser redirect fits in one read.
        let mut head = vec![0u8; 8192];
        let len = stream.read(&mut head).await?;
        head.truncate(len);

        let outcome = Self::parse_callback_request(&String::from_utf8_lossy(&head));
        let (status, page) = if outcome.is_ok() {
            ("200 OK", SUCCESS_HTML)
        } else {
            ("400 Bad Request", FAILURE_HTML)
        };
        let reply = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{page}",
            page.len(),
        );
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await?;

        if outcome.is_ok() {
            tracing::info!("authorization redirect captured");
        }
        outcome
    }

    /// Extract `code` and `state` from the request target of
    /// `GET /path?code=..&state=.. HTTP/1.1`.
    fn parse_callback_request(request: &str) -> Result<CallbackParams> {
        let target = request
            .lines()
            .next()
            .and_then(|line| {
                let mut words = line.split_whitespace();
                words.next().and(words.next())
            })
            .ok_or_else(|| AuthError::failed("malformed redirect request"))?;

        let (_, query) = target
            .split_once('?')
            .ok_or_else(|| AuthError::failed("redirect carried no query parameters"))?;

        let mut code = None;
        let mut state = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => {
                    return Err(AuthError::failed(format!(
                        "authorization server returned error: {value}"
                    )));
                }
                _ => {}
            }
        }

        match (code, state) {
            (Some(code), Some(state)) => Ok(CallbackParams { code, state }),
            (None, _) => Err(AuthError::failed("redirect is missing 'code'")),
            (_, None) => Err(AuthError::failed("redirect is missing 'state'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_and_state_extracted() {
        let params = CallbackServer::parse_callback_request(
            "GET /callback?state=s-1&code=c-1&extra=x HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            params,
            CallbackParams {
                code: "c-1".into(),
                state: "s-1".into()
            }
        );
    }

    #[test]
    fn values_are_form_decoded() {
        let params = CallbackServer::parse_callback_request(
            "GET /cb?code=a%2Fb+c&state=caf%C3%A9 HTTP/1.1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(params.code, "a/b c");
        assert_eq!(params.state, "café");
    }

    #[test]
    fn missing_state_is_rejected() {
        let err = CallbackServer::parse_callback_request("GET /cb?code=abc HTTP/1.1\r\n\r\n")
            .unwrap_err();
        assert!(err.to_string().contains("missing 'state'"));
    }

    #[test]
    fn error_param_is_authentication_failure() {
        let err = CallbackServer::parse_callback_request(
            "GET /cb?error=access_denied&state=xyz HTTP/1.1\r\n\r\n",
        )
        .unwrap_err();
        assert!(
            matches!(err, AuthError::AuthenticationFailed { reason } if reason.contains("access_denied"))
        );
    }

    #[test]
    fn malformed_requests_are_rejected() {
        for request in ["", "GET", "GET /cb HTTP/1.1"] {
            assert!(CallbackServer::parse_callback_request(request).is_err(), "{request:?}");
        }
    }

    #[tokio::test]
    async fn one_redirect_is_served() {
        let server = CallbackServer::bind(0).await.unwrap();
        let port = server.port().unwrap();

        let browser = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(b"GET /callback?code=c-42&state=s-99 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
            let mut page = String::new();
            stream.read_to_string(&mut page).await.unwrap();
            page
        });

        let params = server.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.code, "c-42");
        assert_eq!(params.state, "s-99");
        assert!(browser.await.unwrap().starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn silence_times_out() {
        let server = CallbackServer::bind(0).await.unwrap();
        let err = server.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AuthError::CallbackTimeout { timeout_secs: 0 }));
    }
}
