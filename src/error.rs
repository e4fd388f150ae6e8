use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("GRCI compilation error [near line {line}]: {msg}")]
    Compilation { line: usize, msg: String },
    #[error("GRCI simulation error: {0}")]
    Simulation(String),
    #[error("GRCI memory allocation error: {0}")]
    Memory(String),
    #[error("GRCI internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn compilation(line: usize, msg: impl Into<String>) -> Self {
        Error::Compilation {
            line,
            msg: msg.into(),
        }
    }
}

// 1-based line number of the byte offset `pos` in `src`
pub(crate) fn line_at(src: &str, pos: usize) -> usize {
    src[..pos.min(src.len())]
        .bytes()
        .filter(|&b| b == b'\n')
        .count()
        + 1
}

macro_rules! bail_compile {
    ($line:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::compilation($line, format!($($arg)*)))
    };
}

macro_rules! ensure_compile {
    ($cond:expr, $line:expr, $($arg:tt)*) => {
        if !$cond {
            bail_compile!($line, $($arg)*);
        }
    };
}

pub(crate) use bail_compile;
pub(crate) use ensure_compile;
