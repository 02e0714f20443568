//! Alternate execution path used once per operation after a TLS failure.
//!
//! Enterprise on-prem instances often sit behind certificates that the
//! bundled TLS stack rejects while the system `curl` accepts them.

use crate::redact::redact;
use async_trait::async_trait;
use std::error::Error as StdError;
use std::io::Write;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// A fully built request handed to the fallback executor.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    /// Complete URL including the query string.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Status and body returned by the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Executes a request outside the in-process HTTP client.
#[async_trait]
pub trait FallbackExecutor: Send + Sync {
    /// Run the request. The error string must already be redacted.
    async fn execute(&self, request: &PreparedRequest) -> Result<RawResponse, String>;
}

/// Runs requests through the `curl` executable.
#[derive(Debug, Clone)]
pub struct CurlFallback {
    program: String,
    timeout_secs: u64,
}

impl CurlFallback {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            program: "curl".to_string(),
            timeout_secs,
        }
    }

    /// Use a specific curl binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl FallbackExecutor for CurlFallback {
    async fn execute(&self, request: &PreparedRequest) -> Result<RawResponse, String> {
        // Headers go through a file so credentials stay out of the process list.
        let mut header_file = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
        for (name, value) in &request.headers {
            writeln!(header_file, "{name}: {value}").map_err(|e| e.to_string())?;
        }
        header_file.flush().map_err(|e| e.to_string())?;

        let max_time = self.timeout_secs.to_string();
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["--silent", "--show-error", "--request", request.method.as_str()])
            .args(["--max-time", max_time.as_str()])
            .arg("--header")
            .arg(format!("@{}", header_file.path().display()))
            .args(["--write-out", "\n%{http_code}"])
            .arg(&request.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if request.body.is_some() {
            command.args(["--data-binary", "@-"]).stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.program))?;

        if let (Some(body), Some(mut stdin)) = (&request.body, child.stdin.take()) {
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
        }

        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(redact(stderr.trim()).into_owned());
        }

        parse_curl_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Split curl's `--write-out "\n%{http_code}"` trailer from the body.
pub fn parse_curl_output(stdout: &str) -> Result<RawResponse, String> {
    let (body, code) = stdout
        .rsplit_once('\n')
        .ok_or_else(|| "curl produced no status trailer".to_string())?;
    let status = code
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("unparsable curl status {code:?}: {e}"))?;
    if status == 0 {
        return Err("curl received no HTTP response".to_string());
    }
    Ok(RawResponse {
        status,
        body: body.to_string(),
    })
}

/// Whether an error chain describes a TLS or certificate failure.
///
/// Only the causes are inspected. The outermost HTTP client error embeds the
/// request URL, and a path such as `acme%2Fopenssl-build` is not a handshake
/// failure.
pub fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    const MARKERS: [&str; 5] = ["certificate", "tls", "ssl", "handshake", "x509"];

    let mut current = err.source();
    while let Some(e) = current {
        let message = e.to_string().to_ascii_lowercase();
        if MARKERS.iter().any(|m| message.contains(m)) {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Chained {
        message: &'static str,
        source: Option<Box<Chained>>,
    }

    impl fmt::Display for Chained {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl StdError for Chained {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.source.as_deref().map(|s| s as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn test_detects_certificate_error_deep_in_chain() {
        let err = Chained {
            message: "error sending request",
            source: Some(Box::new(Chained {
                message: "invalid peer certificate: UnknownIssuer",
                source: None,
            })),
        };
        assert!(is_tls_failure(&err));
    }

    #[test]
    fn test_plain_connection_error_is_not_tls() {
        let err = Chained {
            message: "error sending request",
            source: Some(Box::new(Chained {
                message: "connection reset by peer",
                source: None,
            })),
        };
        assert!(!is_tls_failure(&err));
    }

    #[test]
    fn test_url_in_outer_message_is_ignored() {
        let err = Chained {
            message: "error sending request for url (https://ssl-gw.corp/api/v4/projects/acme%2Fopenssl-build)",
            source: Some(Box::new(Chained {
                message: "tcp connect error: Connection refused (os error 111)",
                source: None,
            })),
        };
        assert!(!is_tls_failure(&err));
    }

    #[test]
    fn test_error_without_causes_is_not_tls() {
        let err = Chained {
            message: "tls handshake eof",
            source: None,
        };
        assert!(!is_tls_failure(&err));
    }

    #[test]
    fn test_parse_curl_output() {
        let parsed = parse_curl_output("{\"count\":0}\n200").unwrap();
        assert_eq!(
            parsed,
            RawResponse {
                status: 200,
                body: "{\"count\":0}".to_string(),
            }
        );

        let empty = parse_curl_output("\n204").unwrap();
        assert_eq!(empty.status, 204);
        assert!(empty.body.is_empty());
    }

    #[test]
    fn test_parse_curl_output_rejects_missing_status() {
        assert!(parse_curl_output("no trailer").is_err());
        assert!(parse_curl_output("body\n000").is_err());
    }
}
