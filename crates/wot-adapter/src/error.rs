use std::borrow::Cow;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A device endpoint could not be reached, even after retrying.
    Connection,
    /// A fetched description is not valid `JSON`.
    DescriptionParse,
    /// A device with the same identifier is already registered.
    DuplicateDevice,
    /// A device, property or action is not registered.
    NotFound,
    /// The consumption subsystem has not been started.
    Uninitialized,
    /// A description cannot be turned into a device.
    InvalidDescription,
    /// A request is not compatible with the target affordance.
    InvalidRequest,
    /// Discovery service error.
    Discovery,
    /// Configuration storage error.
    Storage,
    /// An interaction with a consumed Thing failed.
    Thing,
}

impl ErrorKind {
    const fn description(self) -> &'static str {
        match self {
            Self::Connection => "Connection",
            Self::DescriptionParse => "Description Parse",
            Self::DuplicateDevice => "Duplicate Device",
            Self::NotFound => "Not Found",
            Self::Uninitialized => "Uninitialized",
            Self::InvalidDescription => "Invalid Description",
            Self::InvalidRequest => "Invalid Request",
            Self::Discovery => "Discovery",
            Self::Storage => "Storage",
            Self::Thing => "Thing",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A library error.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] of the given [`ErrorKind`] with a description.
    ///
    /// Implementors of the collaborator traits use this constructor to
    /// report their own failures.
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<mdns_sd::Error> for Error {
    fn from(e: mdns_sd::Error) -> Self {
        Self::new(ErrorKind::Discovery, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Storage, e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Storage, e.to_string())
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
