use thiserror::Error;

pub type Result<T, E = RulesError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Two rules produce the same renamed identity, or a renamed identity
    /// shadows an original one. Restoring would be ambiguous.
    #[error("renamed {what} `{name}` collides with another rule")]
    RenameCollision { what: &'static str, name: String },

    #[error("duplicate {what} `{name}` in rule table")]
    Duplicate { what: &'static str, name: String },

    #[error("webhook path `{0}` registered twice")]
    DuplicateWebhookPath(String),
}
