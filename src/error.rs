/// Failures that can occur while relaying captured traffic.
///
/// None of these are fatal. Each is logged at the component boundary where it
/// happens and the relay keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The receiving side (observer, tab bridge, coordinator) is gone or never loaded.
    Delivery(String),
    /// Durable storage could not be read or written.
    Persistence(String),
    /// Payload heuristics failed; correlation enrichment is skipped.
    MalformedFrame(String),
    /// The host platform could not resolve a focused tab.
    NoActiveTab(String),
}

impl RelayError {
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        // `{:#}` keeps the anyhow context chain on one line.
        Self::Persistence(format!("{err:#}"))
    }

    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    pub fn no_active_tab(message: impl Into<String>) -> Self {
        Self::NoActiveTab(message.into())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivery(message) => write!(f, "delivery failed: {message}"),
            Self::Persistence(message) => write!(f, "persistence failed: {message}"),
            Self::MalformedFrame(message) => write!(f, "malformed frame: {message}"),
            Self::NoActiveTab(message) => write!(f, "no active tab: {message}"),
        }
    }
}

impl std::error::Error for RelayError {}
