use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

/// Build an `Error::Protocol` from a format string, the way `io_err!`
/// built an `io::Error` in the teacher crate.
#[macro_export]
macro_rules! proto_err {
    ($($arg:tt)*) => {
        $crate::error::Error::protocol(format!($($arg)*))
    };
}

/// Shorthand for `Err(From::from($err))`.
#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}
