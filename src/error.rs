use std::error::Error;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum ChatError {
    // Multiplexor errors
    MultiplexorCreate(io::Error),
    Registration { fd: RawFd, source: io::Error },
    NotRegistered(RawFd),
    Wait(io::Error),
    UnknownDescriptor(RawFd),

    // Channel errors
    ChannelCreate(io::Error),

    // Socket errors
    Bind(String),
    Listen(String),
    Accept(io::Error),
    Resolve(String),

    // Protocol errors
    Framing(String),
    MessageTooLarge(usize),
    TargetTooLong(usize),
    ShortWrite { expected: usize, written: usize },

    // Component errors
    InvalidState(String),
    QueueLock(String),

    // System errors
    SystemError(String),
    Io(io::Error),

    // Configuration errors
    ConfigError(String),
}

impl ChatError {
    /// Errors that leave the owning component unable to run at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MultiplexorCreate(_)
                | Self::ChannelCreate(_)
                | Self::Bind(_)
                | Self::Listen(_)
                | Self::Registration { .. }
                | Self::ConfigError(_)
        )
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiplexorCreate(e) => write!(f, "Unable to create multiplexor: {}", e),
            Self::Registration { fd, source } => {
                write!(f, "Unable to register descriptor {}: {}", fd, source)
            }
            Self::NotRegistered(fd) => write!(f, "Descriptor {} is not registered", fd),
            Self::Wait(e) => write!(f, "Multiplexor wait failed: {}", e),
            Self::UnknownDescriptor(fd) => write!(f, "Unknown descriptor {} in event list", fd),
            Self::ChannelCreate(e) => write!(f, "Unable to create channel: {}", e),
            Self::Bind(msg) => write!(f, "Bind error: {}", msg),
            Self::Listen(msg) => write!(f, "Listen error: {}", msg),
            Self::Accept(e) => write!(f, "Accept error: {}", e),
            Self::Resolve(msg) => write!(f, "Name resolution error: {}", msg),
            Self::Framing(msg) => write!(f, "Framing error: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::TargetTooLong(size) => write!(f, "Target name too long: {} bytes", size),
            Self::ShortWrite { expected, written } => {
                write!(f, "Short write: {} of {} bytes", written, expected)
            }
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Self::QueueLock(msg) => write!(f, "Queue lock error: {}", msg),
            Self::SystemError(msg) => write!(f, "System error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for ChatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MultiplexorCreate(e)
            | Self::Wait(e)
            | Self::ChannelCreate(e)
            | Self::Accept(e)
            | Self::Io(e) => Some(e),
            Self::Registration { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ChatError {
    fn from(err: io::Error) -> Self {
        ChatError::Io(err)
    }
}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for ChatError {
    fn from(err: PoisonError<T>) -> Self {
        ChatError::QueueLock(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for rusty-chat
pub type Result<T> = std::result::Result<T, ChatError>;
