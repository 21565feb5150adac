use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// The service failed to come up.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InitializationError {
    #[error("Failed to load configuration file from '{path}'")]
    LoadConfig { path: String },
    #[error("Failed to parse configuration")]
    ParseConfig,
    #[error("Host root prefix '{path}' is not mounted")]
    HostRootMissing { path: String },
    #[error("Failed to load TLS credentials from '{path}'")]
    LoadTlsCredentials { path: String },
    #[error("Failed to bind RPC listener")]
    BindListener,
    #[error("Failed while serving RPC requests")]
    Serve,
}

/// The caller sent a request the service cannot act on.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidRequestError {
    #[error("URL must not be empty")]
    EmptyUrl,
    #[error("No download session exists")]
    NoSession,
    #[error("Session id '{requested}' does not match the active session '{active}'")]
    SessionMismatch { requested: String, active: String },
    #[error("Version pattern '{pattern}' is not a valid regular expression")]
    InvalidVersionPattern { pattern: String },
}

/// An operation against the host failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ServicingError {
    #[error("download already in progress")]
    DownloadInProgress,
    #[error("Failed to list installed images")]
    ListInstalledImages,
    #[error("Failed to set default image to '{image}'")]
    SetDefaultImage { image: String },
    #[error("Failed to remove unused images")]
    RemoveUnusedImages,
}

/// An uncategorized error occurred or a bug was encountered.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
/// The category string is preserved in every message that crosses the RPC
/// boundary.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequestError),

    #[error(transparent)]
    Servicing(#[from] ServicingError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct UpgradeErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct UpgradeError(Box<UpgradeErrorInner>);
impl UpgradeError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        UpgradeError(Box::new(UpgradeErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Category string for the kind, e.g. "invalid-request".
    pub fn category(&self) -> &'static str {
        (&self.0.kind).into()
    }

    /// Renders the kind chain and the root cause into a single line suitable
    /// for an RPC status message.
    pub fn status_message(&self) -> String {
        match self.0.source {
            Some(ref source) => format!("{}: {:#}", self.0.kind, source),
            None => self.0.kind.to_string(),
        }
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured UpgradeError.
    fn structured(self, kind: K) -> Result<T, UpgradeError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, UpgradeError> {
        match self {
            Some(t) => Ok(t),
            None => Err(UpgradeError(Box::new(UpgradeErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, UpgradeError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(UpgradeError(Box::new(UpgradeErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait UpgradeResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, UpgradeError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}
impl<T> UpgradeResultExt<T> for Result<T, UpgradeError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, UpgradeError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Debug for UpgradeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
