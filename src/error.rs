#[derive(Debug, failure::Fail)]
pub enum IndexerError {
    #[fail(display = "Invalid argument: {}", 0)]
    InvalidArg(String),
    #[fail(display = "Invalid data: {}", 0)]
    InvalidData(String),
    #[fail(display = "Not found: {}", 0)]
    NotFound(String),
    #[fail(display = "Interface parse error: {}", 0)]
    SmcInterfaceParse(String),
    #[fail(display = "Event parse error: {}", 0)]
    EventParse(String),
    #[fail(display = "VM error: {}", 0)]
    Vm(String),
    #[fail(display = "Database error: {}", 0)]
    Db(String),
    #[fail(display = "Not indexed yet: {}", 0)]
    NotIndexed(String),
}

impl IndexerError {
    pub fn is_not_found(err: &failure::Error) -> bool {
        matches!(err.downcast_ref::<IndexerError>(), Some(IndexerError::NotFound(_)))
    }

    pub fn is_interface_mismatch(err: &failure::Error) -> bool {
        matches!(
            err.downcast_ref::<IndexerError>(),
            Some(IndexerError::SmcInterfaceParse(_)) | Some(IndexerError::Vm(_))
        )
    }

    pub fn is_not_indexed(err: &failure::Error) -> bool {
        matches!(err.downcast_ref::<IndexerError>(), Some(IndexerError::NotIndexed(_)))
    }
}

#[macro_export]
macro_rules! indexer_err {
    ($variant:ident, $($arg:tt)*) => {
        failure::Error::from($crate::error::IndexerError::$variant(format!($($arg)*)))
    };
}
