use std::fmt;

/// An error that can occur when attaching or detaching a [`crate::Monitor`]
#[derive(Debug)]
pub enum Error {
    /// Unable to `mmap` memory for the alternate signal stack
    OutOfMemory,
    /// A monitor already holds the registry claim; only one can be attached
    /// at any one time.
    AlreadyAttached,
    /// The selected [`crate::Mechanism`] does not exist on this target.
    UnsupportedMechanism,
    /// An I/O or other syscall failed
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("unable to allocate memory"),
            Self::AlreadyAttached => f.write_str("a fault monitor is already attached"),
            Self::UnsupportedMechanism => {
                f.write_str("the selected fault interception mechanism is not supported here")
            }
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
