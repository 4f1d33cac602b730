/// Recipe store abstraction layer
///
/// Provides the RecipeStore trait and the recipe data model. Two backends
/// implement it: SQLite (single-file deployments, tests) and PostgreSQL.
/// Each backend keeps its single-statement helpers private and takes an open
/// connection so the trait methods own every transaction boundary.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::RecipeError;

pub mod postgres;
pub mod sqlite;

/// One line of a recipe's ingredient list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Ingredient {
    /// Ingredient name, e.g. "garlic cloves"
    #[serde(alias = "ingred_name")]
    pub name: String,
    /// Quantity in `unit`
    #[serde(default)]
    pub amount: Option<f64>,
    /// Unit of measure, e.g. "cup(s)"
    #[serde(default)]
    pub unit: Option<String>,
    /// Free-form preparation notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Section of the recipe this line belongs to, e.g. "sauce"
    #[serde(default)]
    pub group: Option<String>,
}

impl Ingredient {
    pub fn named(name: impl Into<String>) -> Self {
        Ingredient {
            name: name.into(),
            amount: None,
            unit: None,
            notes: None,
            group: None,
        }
    }
}

/// A stored recipe with its ingredients in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Store-assigned identifier, stable for the recipe's lifetime
    pub id: i64,
    pub name: String,
    pub author: String,
    pub rating: Option<i64>,
    /// Minutes
    pub prep_time: Option<f64>,
    /// Minutes
    pub cook_time: Option<f64>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub ingredients: Vec<Ingredient>,
}

/// Input type for creating a new recipe.
///
/// The store generates id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecipe {
    pub name: String,
    pub author: String,
    #[serde(default)]
    pub rating: Option<i64>,
    #[serde(default)]
    pub prep_time: Option<f64>,
    #[serde(default)]
    pub cook_time: Option<f64>,
    #[serde(default)]
    pub instructions: Option<String>,
    pub ingredients: Vec<Ingredient>,
}

/// One (recipe, ingredient) pair from an inner join of the two tables.
///
/// Only lives between a fetch and `search::aggregate`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub recipe_id: i64,
    pub name: String,
    pub author: String,
    pub rating: Option<i64>,
    pub prep_time: Option<f64>,
    pub cook_time: Option<f64>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub ingredient: Ingredient,
}

impl JoinedRow {
    /// Build the recipe this row belongs to, seeded with the row's ingredient.
    pub fn into_recipe(self) -> Recipe {
        Recipe {
            id: self.recipe_id,
            name: self.name,
            author: self.author,
            rating: self.rating,
            prep_time: self.prep_time,
            cook_time: self.cook_time,
            instructions: self.instructions,
            created_at: self.created_at,
            modified_at: self.modified_at,
            ingredients: vec![self.ingredient],
        }
    }
}

/// Which joined rows to fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinedRowFilter {
    /// Every (recipe, ingredient) pair in the store
    All,
    /// All rows of the given recipes
    RecipeIds(HashSet<i64>),
    /// Rows where any of the given equalities hold (OR-combined).
    /// With no conditions this is a full scan.
    Matching {
        name: Option<String>,
        author: Option<String>,
        ingredient_names: BTreeSet<String>,
    },
}

/// Catalog search criteria. Provided criteria are OR-combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeQuery {
    pub name: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub ingredients: BTreeSet<String>,
}

impl RecipeQuery {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.author.is_none() && self.ingredients.is_empty()
    }

    pub(crate) fn to_filter(&self) -> JoinedRowFilter {
        if self.is_empty() {
            JoinedRowFilter::All
        } else {
            JoinedRowFilter::Matching {
                name: self.name.clone(),
                author: self.author.clone(),
                ingredient_names: self.ingredients.clone(),
            }
        }
    }
}

/// Recipe ids present in a set of joined rows.
pub(crate) fn recipe_ids_of(rows: &[JoinedRow]) -> HashSet<i64> {
    rows.iter().map(|r| r.recipe_id).collect()
}

/// Catalog listing order: by name, ties broken by id.
pub(crate) fn sort_for_listing(recipes: &mut [Recipe]) {
    recipes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}

/// Core abstraction for recipe persistence operations.
///
/// All implementations must be Send + Sync to support concurrent access.
/// Writes are atomic per call; reads that span several statements run
/// inside one transaction.
#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Insert a recipe and its ingredients, then read the stored record back.
    ///
    /// Returns `Inconsistency` if the committed recipe cannot be re-read.
    async fn create(&self, input: NewRecipe) -> Result<Recipe, RecipeError>;

    /// Retrieve a recipe by id, `None` if it does not exist.
    async fn get(&self, id: i64) -> Result<Option<Recipe>, RecipeError>;

    /// Replace a recipe's scalar fields and its whole ingredient list.
    ///
    /// Returns `NotFound` if no recipe has `recipe.id`.
    async fn update(&self, recipe: Recipe) -> Result<Recipe, RecipeError>;

    /// Delete a recipe and its ingredients. Deleting a missing id is a no-op.
    async fn delete(&self, id: i64) -> Result<(), RecipeError>;

    /// Every recipe that has at least one ingredient, ordered by name.
    async fn list(&self) -> Result<Vec<Recipe>, RecipeError>;

    /// Recipes matching any of the query's criteria, ordered by name.
    ///
    /// Returns `None` when nothing matched.
    async fn search(&self, query: &RecipeQuery) -> Result<Option<Vec<Recipe>>, RecipeError>;

    /// Ids of recipes having an ingredient whose name equals one of `names`.
    ///
    /// Returns `None` when `names` is empty (no ingredient filter).
    async fn find_recipe_ids_by_ingredients(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<Option<HashSet<i64>>, RecipeError>;

    /// Flat joined rows, ordered by recipe id then ingredient insertion order.
    async fn fetch_joined_rows(&self, filter: &JoinedRowFilter) -> Result<Vec<JoinedRow>, RecipeError>;

    /// All joined rows of the recipes selected by exact ingredient-name match,
    /// read inside a single transaction. An empty `names` fetches everything.
    async fn fetch_rows_for_ingredients(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<Vec<JoinedRow>, RecipeError>;

    /// Close the underlying pool. Further calls fail with `Storage`.
    async fn close(&self);
}
