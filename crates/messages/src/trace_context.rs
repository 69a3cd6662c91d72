//! Trace context for distributed tracing.
//!
//! Only meaningful when the `trace-propagation` feature is enabled.
//! When disabled, `TraceContext` carries nothing and serializes to an
//! empty list.

#[cfg(feature = "trace-propagation")]
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
#[cfg(feature = "trace-propagation")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde::{Deserialize, Serialize};

/// Trace context carrier for cluster messages.
///
/// When the `trace-propagation` feature is enabled, this carries W3C Trace
/// Context headers so spans can be linked across units.
///
/// When disabled, this serializes to an empty vector, adding minimal
/// overhead to messages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceContext {
    /// W3C Trace Context headers (traceparent, tracestate).
    /// Empty when the feature is disabled.
    pub headers: Vec<(String, String)>,
}

impl TraceContext {
    /// Create a new trace context from the current span.
    ///
    /// When the `trace-propagation` feature is enabled, extracts the current
    /// OpenTelemetry context and serializes it to W3C Trace Context format.
    ///
    /// When disabled, returns an empty context.
    #[allow(unused_variables)]
    pub fn from_current() -> Self {
        #[cfg(feature = "trace-propagation")]
        {
            let propagator = TraceContextPropagator::new();
            let mut headers = Vec::new();
            let cx = opentelemetry::Context::current();
            propagator.inject_context(&cx, &mut VecInjector(&mut headers));
            Self { headers }
        }
        #[cfg(not(feature = "trace-propagation"))]
        {
            Self {
                headers: Vec::new(),
            }
        }
    }

    /// Extract the trace context and return an OpenTelemetry Context.
    #[cfg(feature = "trace-propagation")]
    pub fn extract(&self) -> opentelemetry::Context {
        let propagator = TraceContextPropagator::new();
        propagator.extract(&VecExtractor(&self.headers))
    }

    /// Returns true if trace propagation is enabled at compile time.
    pub const fn is_enabled() -> bool {
        cfg!(feature = "trace-propagation")
    }

    /// Returns true if this context contains trace data.
    pub fn has_trace(&self) -> bool {
        !self.headers.is_empty()
    }
}

/// Injector that writes headers to a Vec.
#[cfg(feature = "trace-propagation")]
struct VecInjector<'a>(&'a mut Vec<(String, String)>);

#[cfg(feature = "trace-propagation")]
impl Injector for VecInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.push((key.to_string(), value));
    }
}

/// Extractor that reads headers from a Vec.
#[cfg(feature = "trace-propagation")]
struct VecExtractor<'a>(&'a [(String, String)]);

#[cfg(feature = "trace-propagation")]
impl Extractor for VecExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }
}
