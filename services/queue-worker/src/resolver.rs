// Function name to invocation URL.

/// Maps a function name to the URL its invocation is POSTed to.
pub trait FunctionResolver: Send + Sync {
    fn function_url(&self, function: &str) -> String;
}

impl<F> FunctionResolver for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn function_url(&self, function: &str) -> String {
        self(function)
    }
}

/// The deployment convention: every function is reachable under its own name
/// on a fixed port, optionally qualified with a DNS suffix.
///
/// ```
/// use queue_worker::resolver::{FunctionResolver, PortConvention};
///
/// let resolver = PortConvention::new(8080);
/// assert_eq!(resolver.function_url("echo"), "http://echo:8080/");
/// let resolver = PortConvention::new(8080).with_suffix(".openfaas-fn");
/// assert_eq!(resolver.function_url("echo"), "http://echo.openfaas-fn:8080/");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConvention {
    port: u16,
    suffix: String,
}

impl PortConvention {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            suffix: String::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }
}

impl FunctionResolver for PortConvention {
    fn function_url(&self, function: &str) -> String {
        format!("http://{}{}:{}/", function, self.suffix, self.port)
    }
}
