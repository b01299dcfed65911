use std::fmt;

#[derive(Debug)]
pub enum HandlerError {
    Io(std::io::Error),
    Csv(Box<csv::Error>),
    Json(serde_json::Error),
    Config(String),
    Ledger(String),
    Remote(String),
    Other(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Io(e) => write!(f, "IO error: {}", e),
            HandlerError::Csv(e) => write!(f, "Table error: {}", e),
            HandlerError::Json(e) => write!(f, "JSON error: {}", e),
            HandlerError::Config(e) => write!(f, "Configuration error: {}", e),
            HandlerError::Ledger(e) => write!(f, "Ledger error: {}", e),
            HandlerError::Remote(e) => write!(f, "Remote error: {}", e),
            HandlerError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Io(e) => Some(e),
            HandlerError::Csv(e) => Some(e.as_ref()),
            HandlerError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl HandlerError {
    /// True for failures the operator has to fix before a run can start.
    pub fn is_config(&self) -> bool {
        matches!(self, HandlerError::Config(_))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Io(err)
    }
}

impl From<csv::Error> for HandlerError {
    fn from(err: csv::Error) -> Self {
        HandlerError::Csv(Box::new(err))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Json(err)
    }
}

impl From<String> for HandlerError {
    fn from(err: String) -> Self {
        HandlerError::Other(err)
    }
}

impl From<&str> for HandlerError {
    fn from(err: &str) -> Self {
        HandlerError::Other(err.to_string())
    }
}
