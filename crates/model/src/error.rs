/// Errors raised while parsing model values from their string forms.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The string is not a well-formed HMS component identifier.
    #[error("invalid xname: {0}")]
    InvalidXname(String),

    /// A stored string does not name any variant of the expected enum.
    #[error("unknown {kind} value: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}
