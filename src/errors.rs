use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PerigeeError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(perigee::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(perigee::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(perigee::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(perigee::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("record not found")]
    #[diagnostic(code(perigee::not_found))]
    NotFound,

    #[error("{0}")]
    #[diagnostic(code(perigee::conflict))]
    Conflict(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(perigee::bad_request))]
    BadRequest(String),

    #[error("{0}")]
    #[diagnostic(code(perigee::other))]
    Other(String),
}
