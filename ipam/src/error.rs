use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("mixed address families in range: {0}")]
    MixedRangeFamily(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no addresses available in [{namespace}] {} [{pool}]", pool_kind(.is_cidr))]
    OutOfIps {
        namespace: String,
        pool: String,
        is_cidr: bool,
    },
}

fn pool_kind(is_cidr: &bool) -> &'static str {
    if *is_cidr {
        "cidr"
    } else {
        "range"
    }
}
