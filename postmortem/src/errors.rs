use crate::format::FormatError;

/// Failure writing a report.
///
/// The fatal path swallows these (there is no caller left to hand them to);
/// the live path surfaces them through [`Error`].
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("report write failed with errno {errno}")]
    Write { errno: i32 },
    #[error("a record overflowed its staging buffer")]
    RecordOverflow,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The reporter (or some other fault monitor) is already enabled.
    #[error("the crash reporter is already active")]
    AlreadyActive,
    /// The configured interception mechanism does not exist on this target.
    #[error("the selected fault interception mechanism is not supported on this target")]
    UnsupportedMechanism,
    /// Installing fault interception was denied by the OS.
    #[error("permission denied installing fault interception")]
    PermissionDenied,
    /// No pending crash report exists at the configured path.
    #[error("no pending crash report")]
    NotFound,
    /// The live-report target thread does not exist or did not respond.
    #[error("the target thread does not exist or did not respond")]
    InvalidThread,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<postmortem_monitor::Error> for Error {
    fn from(err: postmortem_monitor::Error) -> Self {
        use postmortem_monitor::Error as ME;
        match err {
            ME::AlreadyAttached => Self::AlreadyActive,
            ME::UnsupportedMechanism => Self::UnsupportedMechanism,
            ME::Io(io) => match io.raw_os_error() {
                Some(libc::EPERM | libc::EACCES) => Self::PermissionDenied,
                _ => Self::Io(io),
            },
            ME::OutOfMemory => Self::Io(std::io::Error::from_raw_os_error(libc::ENOMEM)),
        }
    }
}
