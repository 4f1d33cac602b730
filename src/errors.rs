/// Domain-specific error types for recipe-alchemy
///
/// Reads report a missing recipe as `None`, so `NotFound` is reserved for
/// writes that target a recipe id the store does not know.

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Recipe not found: {id}")]
    NotFound {
        id: i64
    },

    /// A just-written row could not be read back, or a computed score broke
    /// its upper bound. Never recovered from.
    #[error("Inconsistency: {0}")]
    Inconsistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The store is unreachable or rejected a statement.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for RecipeError {
    fn from(e: sqlx::Error) -> Self {
        RecipeError::Storage(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for RecipeError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        RecipeError::Storage(format!("Migration failed: {}", e))
    }
}

impl RecipeError {
    /// Helper to create validation errors with field names
    ///
    /// Example:
    /// ```
    /// use recipe_alchemy::errors::RecipeError;
    /// let err = RecipeError::validation("name", "Name cannot be empty");
    /// ```
    pub fn validation(field: &str, message: &str) -> Self {
        RecipeError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }

    /// True for errors that indicate a bug or a concurrent-mutation race
    /// rather than bad input or an unavailable store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecipeError::Inconsistency(_))
    }
}
