//! Wire protocol for the image proxy
//!
//! Each message is one JSON document carried in a single `SOCK_SEQPACKET`
//! packet. Bulk data never appears here: a reply with a non-zero `pipeid`
//! carries the read end of a pipe as `SCM_RIGHTS` ancillary data instead.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProxyError, Result};

/// Protocol version returned by `Initialize`.
pub const PROTOCOL_VERSION: &str = "0.2.6";

/// Major prefix a peer must share to be compatible. The `0.x` series treats
/// the minor component as the compatibility boundary.
pub const PROTOCOL_MAJOR: &str = "0.2";

/// Maximum size of a single control message in bytes.
pub const MAX_MSG_SIZE: usize = 32 * 1024;

/// A call from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Name of the method to invoke
    pub method: String,
    /// Positional arguments, interpreted per method
    #[serde(default, deserialize_with = "null_as_empty")]
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(method: Method, args: Vec<Value>) -> Self {
        Self {
            method: method.as_str().to_owned(),
            args,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The server's answer to exactly one [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// True if and only if the call succeeded
    pub success: bool,
    /// Arbitrary return value of the call
    #[serde(default)]
    pub value: Value,
    /// Pipe to pass to `FinishPipe`; 0 means no descriptor is attached
    #[serde(rename = "pipeid", default)]
    pub pipe_id: u32,
    /// Non-empty if `success` is false
    #[serde(default)]
    pub error: String,
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self {
            success: true,
            value,
            pipe_id: 0,
            error: String::new(),
        }
    }

    pub fn with_pipe(value: Value, pipe_id: u32) -> Self {
        Self {
            pipe_id,
            ..Self::ok(value)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: Value::Null,
            pipe_id: 0,
            error: message.into(),
        }
    }
}

/// The closed set of methods the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    OpenImage,
    OpenImageOptional,
    CloseImage,
    GetManifest,
    GetConfig,
    GetBlob,
    FinishPipe,
    Shutdown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Initialize => "Initialize",
            Method::OpenImage => "OpenImage",
            Method::OpenImageOptional => "OpenImageOptional",
            Method::CloseImage => "CloseImage",
            Method::GetManifest => "GetManifest",
            Method::GetConfig => "GetConfig",
            Method::GetBlob => "GetBlob",
            Method::FinishPipe => "FinishPipe",
            Method::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Initialize" => Ok(Method::Initialize),
            "OpenImage" => Ok(Method::OpenImage),
            "OpenImageOptional" => Ok(Method::OpenImageOptional),
            "CloseImage" => Ok(Method::CloseImage),
            "GetManifest" => Ok(Method::GetManifest),
            "GetConfig" => Ok(Method::GetConfig),
            "GetBlob" => Ok(Method::GetBlob),
            "FinishPipe" => Ok(Method::FinishPipe),
            "Shutdown" => Ok(Method::Shutdown),
            other => Err(ProxyError::UnknownMethod(other.to_owned())),
        }
    }
}

/// Positional argument decoder for one call.
pub struct Args<'a> {
    method: Method,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(method: Method, values: &'a [Value]) -> Self {
        Self { method, values }
    }

    /// Require exactly `n` arguments.
    pub fn expect_len(&self, n: usize) -> Result<()> {
        if self.values.len() != n {
            return Err(ProxyError::invalid_args(
                self.method.as_str(),
                format!("expected {} arguments, got {}", n, self.values.len()),
            ));
        }
        Ok(())
    }

    pub fn string(&self, idx: usize) -> Result<&'a str> {
        self.values
            .get(idx)
            .and_then(Value::as_str)
            .ok_or_else(|| self.kind_error(idx, "a string"))
    }

    /// An unsigned 32-bit id.
    ///
    /// Integral floats are accepted because some clients decode every JSON
    /// number as a double and send ids back in that form.
    pub fn u32(&self, idx: usize) -> Result<u32> {
        let value = self.values.get(idx);
        let n = value.and_then(|v| {
            v.as_u64().or_else(|| {
                v.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u64)
            })
        });
        n.and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| self.kind_error(idx, "an unsigned 32-bit integer"))
    }

    /// A signed integer, used for size hints where -1 means unknown.
    pub fn i64(&self, idx: usize) -> Result<i64> {
        let value = self.values.get(idx);
        value
            .and_then(|v| {
                v.as_i64().or_else(|| {
                    v.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
            })
            .ok_or_else(|| self.kind_error(idx, "an integer"))
    }

    fn kind_error(&self, idx: usize, expected: &str) -> ProxyError {
        let found = match self.values.get(idx) {
            None => "nothing".to_owned(),
            Some(v) => v.to_string(),
        };
        ProxyError::invalid_args(
            self.method.as_str(),
            format!("argument {idx} must be {expected}, found {found}"),
        )
    }
}

/// Check that a peer's version shares our major prefix.
pub fn check_version(version: &str) -> Result<()> {
    let incompatible = || ProxyError::IncompatibleVersion {
        expected: PROTOCOL_MAJOR.to_owned(),
        actual: version.to_owned(),
    };
    let parts: Vec<u64> = version
        .splitn(3, '.')
        .map(|p| p.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| incompatible())?;
    match parts.as_slice() {
        [major, minor, _patch] if format!("{major}.{minor}") == PROTOCOL_MAJOR => Ok(()),
        _ => Err(incompatible()),
    }
}
