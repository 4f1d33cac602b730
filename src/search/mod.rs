pub mod aggregate;
pub mod finder;

// Re-export key types for convenience
pub use aggregate::aggregate;
pub use finder::{rank, score_recipe, RecipeFinder, ScoredRecipe};
