//! Error types for ZTP provisioning
//!
//! Errors are structured with fields so that a failure can be traced back to
//! the site file, template, object or setter that produced it. Every layer
//! (loader, query evaluator, template engine, hub client, applier) reports
//! through this single enum.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for ZTP operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Site YAML is malformed or can't be read
    #[error("failed to parse {source_name}: {message}")]
    ConfigParse {
        /// File name, or `YAML` when loading from text or bytes
        source_name: String,
        /// Description of what failed
        message: String,
    },

    /// Site YAML is well formed but a field has the wrong shape
    #[error("invalid configuration at '{path}': {message}")]
    ConfigSchema {
        /// Location of the offending field (e.g. `edgeclusters[0].sno.master0`)
        path: String,
        /// Description of what's invalid
        message: String,
    },

    /// A required configuration option is absent
    #[error("configuration option '{option}' is required: {message}")]
    EnvMissing {
        /// Name of the option (e.g. `PULL_SECRET`)
        option: String,
        /// Why the option was needed
        message: String,
    },

    /// The hub API can't be reached
    #[error("hub is unreachable: {message}")]
    HubUnreachable {
        /// Description of what failed
        message: String,
    },

    /// Generic API transport or server failure
    #[error("transport error: {message}")]
    Transport {
        /// Description of what failed
        message: String,
        /// HTTP status code when the server answered
        code: Option<u16>,
    },

    /// Object doesn't exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind
        kind: String,
        /// Object name, including namespace when known
        name: String,
    },

    /// Object already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind
        kind: String,
        /// Object name, including namespace when known
        name: String,
    },

    /// Optimistic concurrency conflict
    #[error("conflict: {message}")]
    Conflict {
        /// Description returned by the server
        message: String,
    },

    /// Caller isn't allowed to perform the operation
    #[error("forbidden: {message}")]
    Forbidden {
        /// Description returned by the server
        message: String,
    },

    /// Operation was cancelled before it completed
    #[error("cancelled: {message}")]
    Cancelled {
        /// What was being waited for
        message: String,
    },

    /// Referenced template doesn't exist
    #[error("failed to find template '{name}'")]
    TemplateNotFound {
        /// Template name
        name: String,
    },

    /// Template failed to render or its output isn't valid
    #[error("failed to render template '{template}': {message}")]
    TemplateRender {
        /// Template name
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Helper called with the wrong number of arguments
    #[error("wrong number of arguments for '{helper}': {message}")]
    TemplateArity {
        /// Helper name
        helper: String,
        /// Description of the expected arguments
        message: String,
    },

    /// Helper called with an argument of the wrong type
    #[error("wrong argument type for '{helper}': {message}")]
    TemplateType {
        /// Helper name
        helper: String,
        /// Description of the expected type
        message: String,
    },

    /// Query has invalid syntax
    #[error("failed to parse query '{query}': {message}")]
    QueryParse {
        /// Query text
        query: String,
        /// Description of the syntax problem
        message: String,
    },

    /// Query results can't be stored in the destination type
    #[error("failed to convert results of query '{query}': {message}")]
    QueryType {
        /// Query text
        query: String,
        /// Description of the mismatch
        message: String,
    },

    /// Query failed while evaluating
    #[error("failed to evaluate query '{query}': {message}")]
    QueryRuntime {
        /// Query text
        query: String,
        /// Description of what failed
        message: String,
    },

    /// Readiness wait exceeded its deadline
    #[error("timed out waiting for {what}")]
    ApplyTimeout {
        /// What was being waited for
        what: String,
    },

    /// Disappearance wait exceeded its deadline
    #[error("timed out waiting for deletion of {what}")]
    DeleteTimeout {
        /// What was being waited for
        what: String,
    },

    /// Status subresource update failed
    #[error("failed to update status of {object}: {message}")]
    StatusError {
        /// Object description (`kind namespace/name`)
        object: String,
        /// Description of what failed
        message: String,
    },

    /// Object creation failed
    #[error("failed to create {object}: {message}")]
    CreateError {
        /// Object description (`kind namespace/name`)
        object: String,
        /// Description of what failed
        message: String,
    },

    /// Object deletion failed
    #[error("failed to delete {object}: {message}")]
    DeleteError {
        /// Object description (`kind namespace/name`)
        object: String,
        /// Description of what failed
        message: String,
    },

    /// A step of a named pipeline failed (e.g. an enricher setter)
    #[error("{step}: {source}")]
    Step {
        /// Step name
        step: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Validation error for inputs the model can't accept
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "tunnel", "watch")
        context: String,
    },
}

impl Error {
    /// Create a parse error for YAML that didn't come from a file
    pub fn config_parse(msg: impl Into<String>) -> Self {
        Self::ConfigParse {
            source_name: "YAML".to_string(),
            message: msg.into(),
        }
    }

    /// Create a parse error for a named file
    pub fn config_parse_file(file: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigParse {
            source_name: format!("file '{}'", file.into()),
            message: msg.into(),
        }
    }

    /// Create a schema error for the field at `path`
    pub fn config_schema(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigSchema {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an error for a missing configuration option
    pub fn env_missing(option: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::EnvMissing {
            option: option.into(),
            message: msg.into(),
        }
    }

    /// Create a hub unreachable error
    pub fn hub_unreachable(msg: impl Into<String>) -> Self {
        Self::HubUnreachable {
            message: msg.into(),
        }
    }

    /// Create a transport error without a status code
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            code: None,
        }
    }

    /// Create a not found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled {
            message: msg.into(),
        }
    }

    /// Create a template render error
    pub fn template_render(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TemplateRender {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create a query parse error
    pub fn query_parse(query: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::QueryParse {
            query: query.into(),
            message: msg.into(),
        }
    }

    /// Create a query type error
    pub fn query_type(query: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::QueryType {
            query: query.into(),
            message: msg.into(),
        }
    }

    /// Create a query runtime error
    pub fn query_runtime(query: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::QueryRuntime {
            query: query.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the name of the step that produced it
    pub fn in_step(step: impl Into<String>, source: Error) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Return the innermost error, looking through step wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if the object the operation targeted doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    /// True if the object the operation tried to create already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }

    /// True for optimistic concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Conflicts and transport failures may succeed on a second attempt.
    /// Everything produced from local input (config, templates, queries)
    /// needs a fix before it can succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Conflict { .. } => true,
            Error::HubUnreachable { .. } => true,
            Error::Transport { code, .. } => !matches!(code, Some(c) if (400..500).contains(c)),
            Error::Internal { .. } => true,
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound {
                    kind: UNKNOWN_CONTEXT.to_string(),
                    name: ae.message,
                },
                409 if ae.reason == "AlreadyExists" => Error::AlreadyExists {
                    kind: UNKNOWN_CONTEXT.to_string(),
                    name: ae.message,
                },
                409 => Error::Conflict {
                    message: ae.message,
                },
                401 | 403 => Error::Forbidden {
                    message: ae.message,
                },
                code => Error::Transport {
                    message: ae.message,
                    code: Some(code),
                },
            },
            kube::Error::HyperError(e) => Error::hub_unreachable(e.to_string()),
            kube::Error::Service(e) => Error::hub_unreachable(e.to_string()),
            other => Error::transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
