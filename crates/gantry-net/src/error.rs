use thiserror::Error;

use crate::endpoint::EndpointError;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("endpoint: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("bind {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
}
