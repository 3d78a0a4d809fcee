use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("TLS setup failed: {msg}")]
    TlsError { msg: String },

    #[error("Invalid server name {name:?}")]
    InvalidServerName { name: String },

    #[error("Unexpected response from server: {msg}")]
    UnexpectedResponse { msg: String },

    #[error("ERROR: {msg}")]
    CustomError { msg: String },
}

impl ServerError {
    pub fn tls_error(msg: impl Into<String>) -> Self {
        Self::TlsError { msg: msg.into() }
    }

    pub fn custom_error(msg: impl Into<String>) -> Self {
        Self::CustomError { msg: msg.into() }
    }
}
