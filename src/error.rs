//! Contains the `Error` and `Result` types that `mangrove` uses.

use std::{collections::HashMap, fmt};

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The result type for all methods that can return an error in the `mangrove` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Integer error codes matching the reference server, along with their code names.
pub mod code {
    /// A malformed argument value was provided to an operator or command.
    pub const BAD_VALUE: i32 = 2;

    /// An operator or command document could not be parsed.
    pub const FAILED_TO_PARSE: i32 = 9;

    /// An operator received a value of the wrong runtime type.
    pub const TYPE_MISMATCH: i32 = 14;

    /// An unexpected internal failure.
    pub const INTERNAL_ERROR: i32 = 16;

    /// The named collection does not exist.
    pub const NAMESPACE_NOT_FOUND: i32 = 26;

    /// The named index does not exist.
    pub const INDEX_NOT_FOUND: i32 = 27;

    /// A dotted path could not be created through an existing non-document value.
    pub const PATH_NOT_VIABLE: i32 = 28;

    /// Two update operators target the same field.
    pub const CONFLICTING_UPDATE_OPERATORS: i32 = 40;

    /// The requested cursor id is not registered.
    pub const CURSOR_NOT_FOUND: i32 = 43;

    /// The command name is not recognized.
    pub const COMMAND_NOT_FOUND: i32 = 59;

    /// An immutable field (such as `_id`) would be modified.
    pub const IMMUTABLE_FIELD: i32 = 66;

    /// The index specification cannot be materialized.
    pub const CANNOT_CREATE_INDEX: i32 = 67;

    /// Invalid options were provided to a command.
    pub const INVALID_OPTIONS: i32 = 72;

    /// An index with the same name but a different key specification exists.
    pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

    /// A document failed collection validation.
    pub const DOCUMENT_VALIDATION_FAILURE: i32 = 121;

    /// An unknown operator was used inside an aggregation expression.
    pub const INVALID_PIPELINE_OPERATOR: i32 = 168;

    /// A `$convert`-family operator could not convert its input.
    pub const CONVERSION_FAILURE: i32 = 241;

    /// No viable execution plan exists, e.g. `$near` without a geospatial index.
    pub const NO_QUERY_EXECUTION_PLANS: i32 = 291;

    /// A write violated a unique index constraint.
    pub const DUPLICATE_KEY: i32 = 11000;

    /// The operation was cancelled by the caller.
    pub const INTERRUPTED: i32 = 11601;

    /// The name the reference server associates with `code`, or `Location<code>` when the
    /// code has no registered name.
    pub fn name(code: i32) -> String {
        match code {
            BAD_VALUE => "BadValue".to_string(),
            FAILED_TO_PARSE => "FailedToParse".to_string(),
            TYPE_MISMATCH => "TypeMismatch".to_string(),
            INTERNAL_ERROR => "InternalError".to_string(),
            NAMESPACE_NOT_FOUND => "NamespaceNotFound".to_string(),
            INDEX_NOT_FOUND => "IndexNotFound".to_string(),
            PATH_NOT_VIABLE => "PathNotViable".to_string(),
            CONFLICTING_UPDATE_OPERATORS => "ConflictingUpdateOperators".to_string(),
            CURSOR_NOT_FOUND => "CursorNotFound".to_string(),
            COMMAND_NOT_FOUND => "CommandNotFound".to_string(),
            IMMUTABLE_FIELD => "ImmutableField".to_string(),
            CANNOT_CREATE_INDEX => "CannotCreateIndex".to_string(),
            INVALID_OPTIONS => "InvalidOptions".to_string(),
            INDEX_KEY_SPECS_CONFLICT => "IndexKeySpecsConflict".to_string(),
            DOCUMENT_VALIDATION_FAILURE => "DocumentValidationFailure".to_string(),
            INVALID_PIPELINE_OPERATOR => "InvalidPipelineOperator".to_string(),
            CONVERSION_FAILURE => "ConversionFailure".to_string(),
            NO_QUERY_EXECUTION_PLANS => "NoQueryExecutionPlans".to_string(),
            DUPLICATE_KEY => "DuplicateKey".to_string(),
            INTERRUPTED => "Interrupted".to_string(),
            other => format!("Location{}", other),
        }
    }
}

/// An error that can occur in the `mangrove` crate. The inner [`ErrorKind`] is wrapped in a
/// `Box` to keep the type cheap to move through `Result`; errors are cloneable so that bulk
/// writes can both record and surface them.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        Error::command(code::INTERNAL_ERROR, message)
    }

    /// Creates a command error carrying the given server error code.
    pub(crate) fn command(code: i32, message: impl Into<String>) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: code::name(code),
            message: message.into(),
        })
        .into()
    }

    pub(crate) fn bad_value(message: impl Into<String>) -> Error {
        Error::command(code::BAD_VALUE, message)
    }

    pub(crate) fn failed_to_parse(message: impl Into<String>) -> Error {
        Error::command(code::FAILED_TO_PARSE, message)
    }

    pub(crate) fn type_mismatch(message: impl Into<String>) -> Error {
        Error::command(code::TYPE_MISMATCH, message)
    }

    pub(crate) fn interrupted() -> Error {
        Error::command(code::INTERRUPTED, "operation was interrupted")
    }

    /// Creates the write error a unique index raises on a key collision. The message shape
    /// (`E11000 duplicate key error ... index: <name> dup key: { <path>: <value> }`) is what
    /// drivers pattern-match on, so it is kept byte-compatible.
    pub(crate) fn duplicate_key(
        namespace: impl fmt::Display,
        index_name: &str,
        dup_key: &Document,
    ) -> Error {
        ErrorKind::Write(WriteError {
            code: code::DUPLICATE_KEY,
            code_name: Some(code::name(code::DUPLICATE_KEY)),
            message: format!(
                "E11000 duplicate key error collection: {} index: {} dup key: {}",
                namespace, index_name, dup_key
            ),
            details: None,
        })
        .into()
    }

    /// Whether this error is a unique key violation.
    pub fn is_duplicate_key(&self) -> bool {
        self.code() == Some(code::DUPLICATE_KEY)
    }

    /// Whether this error is a caller-requested interruption.
    pub fn is_interrupted(&self) -> bool {
        self.code() == Some(code::INTERRUPTED)
    }

    /// Gets the server error code from this error, if it carries one. For a bulk failure
    /// this is the code of the first write error.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::Write(write_error) => Some(write_error.code),
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .first()
                .map(|write_error| write_error.code),
            _ => None,
        }
    }

    /// Gets the code name from this error, if applicable.
    pub fn code_name(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref cmd_err) => Some(cmd_err.code_name.as_str()),
            ErrorKind::Write(ref write_error) => write_error.code_name.as_deref(),
            ErrorKind::BulkWrite(ref failure) => failure
                .write_errors
                .first()
                .and_then(|write_error| write_error.code_name.as_deref()),
            _ => None,
        }
    }

    /// Gets the human-readable message for this error, if applicable. If this error is a
    /// bulk write failure, the per-operation messages are concatenated.
    pub fn message(&self) -> Option<String> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.message.clone()),
            ErrorKind::Write(write_error) => Some(write_error.message.clone()),
            ErrorKind::BulkWrite(failure) => {
                let mut msg = String::new();
                for write_error in &failure.write_errors {
                    msg.push_str(write_error.message.as_str());
                }
                Some(msg)
            }
            ErrorKind::InvalidArgument { message } => Some(message.clone()),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err.to_string())
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err.to_string())
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided to an entry point. Raised before any side effects.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A command failed with a server error code.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred when trying to execute a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteError),

    /// An error occurred when trying to execute a write operation consisting of multiple
    /// writes.
    #[error("An error occurred when trying to execute a multi-write operation: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(String),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(String),
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// An error that occurred during a write operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// An error that occurred during a write operation consisting of multiple writes.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Index into the list of operations that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

impl BulkWriteError {
    pub(crate) fn from_write_error(index: usize, error: Error) -> Self {
        match *error.kind {
            ErrorKind::Write(write_error) => BulkWriteError {
                index,
                code: write_error.code,
                code_name: write_error.code_name,
                message: write_error.message,
                details: write_error.details,
            },
            other => {
                let error = Error::new(other);
                BulkWriteError {
                    index,
                    code: error.code().unwrap_or(code::INTERNAL_ERROR),
                    code_name: error.code_name().map(String::from),
                    message: error.message().unwrap_or_else(|| error.to_string()),
                    details: None,
                }
            }
        }
    }
}

/// The set of errors that occurred during a multi-write operation, along with the writes
/// that did succeed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The error(s) that occurred, each carrying the index of the operation that failed.
    pub write_errors: Vec<BulkWriteError>,

    /// The `_id` values of the documents that were successfully inserted before (ordered)
    /// or around (unordered) the failures.
    #[serde(skip)]
    pub inserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteFailure {
    pub(crate) fn new() -> Self {
        BulkWriteFailure {
            write_errors: Vec::new(),
            inserted_ids: Default::default(),
        }
    }
}

/// Collapses an [`ErrorKind::BulkWrite`] produced by a single-write entry point into
/// [`ErrorKind::Write`], leaving all other errors untouched.
pub(crate) fn convert_bulk_errors(error: Error) -> Error {
    match *error.kind {
        ErrorKind::BulkWrite(failure) => match failure.write_errors.into_iter().next() {
            Some(bulk_error) => ErrorKind::Write(WriteError {
                code: bulk_error.code,
                code_name: bulk_error.code_name,
                message: bulk_error.message,
                details: bulk_error.details,
            })
            .into(),
            None => Error::internal("bulk failure missing write errors"),
        },
        _ => error,
    }
}
