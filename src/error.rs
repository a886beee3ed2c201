use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlakrsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error at position {position}: {source}")]
    Xml {
        source: quick_xml::Error,
        position: usize,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Search store error: {0}")]
    Store(String),

    #[error("Unknown test result value '{0}'")]
    UnknownTestResult(String),

    #[error("Unknown build status value '{0}'")]
    UnknownBuildStatus(String),

    #[error(
        "Report set changed for test '{class_name}.{test_name}' within one batch: \
         '{expected}' vs '{found}'"
    )]
    ReportSetChanged {
        class_name: String,
        test_name: String,
        expected: String,
        found: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FlakrsError>;
