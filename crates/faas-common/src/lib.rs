// Shared data types for the async invocation pipeline.
use bytes::Bytes;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Status reported when the target function could not be reached at all.
pub const SERVICE_UNAVAILABLE: u16 = 503;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("decode invocation request: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Unit of work pulled from the queue: a target function and its payload.
///
/// Field names follow the producer's serialization (`Function`, `Body`) and
/// are matched without regard to case on decode. Missing fields decode to
/// empty values and unknown fields are ignored.
///
/// ```
/// use faas_common::InvocationRequest;
///
/// let req = InvocationRequest::decode(br#"{"Function":"echo","Body":"hi"}"#).expect("decode");
/// assert_eq!(req.function, "echo");
/// assert_eq!(&req.body[..], b"hi");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationRequest {
    #[serde(rename = "Function")]
    pub function: String,
    #[serde(rename = "Body", serialize_with = "body::serialize")]
    pub body: Bytes,
}

impl<'de> Deserialize<'de> for InvocationRequest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        let mut request = Self::default();
        for (key, value) in fields {
            if key.eq_ignore_ascii_case("function") {
                request.function = match value {
                    Value::Null => String::new(),
                    value => String::deserialize(value).map_err(de::Error::custom)?,
                };
            } else if key.eq_ignore_ascii_case("body") {
                request.body = body::deserialize(value).map_err(de::Error::custom)?;
            }
        }
        Ok(request)
    }
}

impl InvocationRequest {
    pub fn new(function: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            function: function.into(),
            body: body.into(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decodes a payload, falling back to the empty request on malformed input.
    ///
    /// The decode error is handed back so callers can log it; the empty request
    /// is still meant to be dispatched.
    pub fn decode_lossy(payload: &[u8]) -> (Self, Option<Error>) {
        match Self::decode(payload) {
            Ok(req) => (req, None),
            Err(err) => (Self::default(), Some(err)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Result of a single invocation attempt. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub function: String,
    pub status_code: u16,
    pub elapsed: Duration,
}

impl InvocationOutcome {
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    pub fn to_report(&self) -> CompletionReport {
        CompletionReport {
            function_name: self.function.clone(),
            status_code: self.status_code,
            time_taken: self.elapsed_seconds(),
        }
    }
}

/// Wire body posted to the gateway after every invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub function_name: String,
    pub status_code: u16,
    pub time_taken: f64,
}

mod body {
    // Producers encode bytes as base64 strings; hand-written payloads often
    // carry the raw text instead, so both are accepted.
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BodyVisitor)
    }

    struct BodyVisitor;

    impl<'de> Visitor<'de> for BodyVisitor {
        type Value = Bytes;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a base64 string, a raw string, a byte array or null")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Bytes, E> {
            match STANDARD.decode(value) {
                Ok(decoded) => Ok(Bytes::from(decoded)),
                Err(_) => Ok(Bytes::copy_from_slice(value.as_bytes())),
            }
        }

        fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Bytes, E> {
            Ok(Bytes::copy_from_slice(value))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Bytes, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(Bytes::from(out))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Bytes, E> {
            Ok(Bytes::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Bytes, E> {
            Ok(Bytes::new())
        }
    }
}
