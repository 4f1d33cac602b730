/// Ingredient-driven recipe ranking.
///
/// Matching happens in two stages. The store selects candidate recipes by
/// exact ingredient-name equality (indexable), then each candidate is scored
/// by substring containment, so "garlic" scores against "garlic cloves".
/// The first stage never selects a recipe whose only match is a substring
/// match; that under-selection is current behavior and is kept.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::errors::RecipeError;
use crate::search::aggregate;
use crate::store::{Recipe, RecipeStore};

/// A recipe with the number of wanted ingredients it matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecipe {
    pub score: u32,
    pub recipe: Recipe,
}

/// Count the wanted names found as a substring of at least one of the
/// recipe's distinct ingredient names. Each wanted name scores at most once.
pub fn score_recipe(recipe: &Recipe, wanted: &BTreeSet<String>) -> u32 {
    let unique: HashSet<&str> = recipe.ingredients.iter().map(|i| i.name.as_str()).collect();
    wanted
        .iter()
        .filter(|w| unique.iter().any(|name| name.contains(w.as_str())))
        .count() as u32
}

/// Score every recipe and sort best-first. Ties keep their input order.
pub fn rank(recipes: Vec<Recipe>, wanted: &BTreeSet<String>) -> Result<Vec<ScoredRecipe>, RecipeError> {
    let max_score = wanted.len() as u32;
    let mut scored = Vec::with_capacity(recipes.len());

    for recipe in recipes {
        let score = score_recipe(&recipe, wanted);
        if score > max_score {
            return Err(RecipeError::Inconsistency(format!(
                "Recipe {} scored {} but at most {} ingredients were requested",
                recipe.id, score, max_score
            )));
        }
        scored.push(ScoredRecipe { score, recipe });
    }

    // sort_by is stable
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    Ok(scored)
}

/// Finds and ranks recipes for a set of wanted ingredients.
pub struct RecipeFinder {
    store: Arc<dyn RecipeStore + Send + Sync>,
}

impl RecipeFinder {
    pub fn new(store: Arc<dyn RecipeStore + Send + Sync>) -> Self {
        Self { store }
    }

    /// Recipes containing at least one of `wanted`, best match first.
    ///
    /// Recipes whose id is in `exclude` are dropped before scoring; ids that
    /// do not exist are ignored. An empty `wanted` returns every recipe with
    /// score 0 in id order.
    pub async fn find_and_score(
        &self,
        wanted: &BTreeSet<String>,
        exclude: Option<&HashSet<i64>>,
    ) -> Result<Vec<ScoredRecipe>, RecipeError> {
        let rows = self.store.fetch_rows_for_ingredients(wanted).await?;
        let fetched = rows.len();

        let rows: Vec<_> = match exclude {
            Some(excluded) => rows
                .into_iter()
                .filter(|row| !excluded.contains(&row.recipe_id))
                .collect(),
            None => rows,
        };

        let scored = rank(aggregate(rows), wanted)?;

        tracing::debug!(
            wanted = wanted.len(),
            excluded = exclude.map(|e| e.len()).unwrap_or(0),
            rows = fetched,
            results = scored.len(),
            top_score = scored.first().map(|s| s.score).unwrap_or(0),
            "Recipes ranked"
        );

        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteRecipeStore;
    use crate::store::{Ingredient, NewRecipe};
    use chrono::Utc;

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn recipe(id: i64, ingredients: &[&str]) -> Recipe {
        Recipe {
            id,
            name: format!("Recipe {}", id),
            author: "Joe".to_string(),
            rating: None,
            prep_time: None,
            cook_time: None,
            instructions: None,
            created_at: Utc::now(),
            modified_at: Utc::now(),
            ingredients: ingredients.iter().map(|n| Ingredient::named(*n)).collect(),
        }
    }

    fn new_recipe(name: &str, ingredients: &[&str]) -> NewRecipe {
        NewRecipe {
            name: name.to_string(),
            author: "Joe".to_string(),
            rating: None,
            prep_time: None,
            cook_time: None,
            instructions: None,
            ingredients: ingredients.iter().map(|n| Ingredient::named(*n)).collect(),
        }
    }

    async fn finder_with(recipes: Vec<(&str, Vec<&str>)>) -> (RecipeFinder, Vec<Recipe>) {
        let store = Arc::new(SqliteRecipeStore::in_memory().await.unwrap());
        let mut created = Vec::new();
        for (name, ingredients) in recipes {
            created.push(store.create(new_recipe(name, &ingredients)).await.unwrap());
        }
        (RecipeFinder::new(store), created)
    }

    #[test]
    fn test_each_wanted_ingredient_scores_once() {
        let r = recipe(1, &["salt", "kosher salt"]);
        assert_eq!(score_recipe(&r, &names(&["salt"])), 1);
    }

    #[test]
    fn test_substring_match_scores() {
        let r = recipe(1, &["garlic cloves", "olive oil"]);
        assert_eq!(score_recipe(&r, &names(&["garlic", "oil", "basil"])), 2);
    }

    #[test]
    fn test_duplicate_ingredient_names_do_not_inflate_score() {
        let r = recipe(1, &["salt", "salt", "pepper"]);
        assert_eq!(score_recipe(&r, &names(&["salt", "pepper"])), 2);
    }

    #[test]
    fn test_rank_sorts_descending_and_keeps_ties_stable() {
        let wanted = names(&["a", "b", "c"]);
        let recipes = vec![
            recipe(1, &["a"]),
            recipe(2, &["a", "b", "c"]),
            recipe(3, &["b"]),
            recipe(4, &["a", "c"]),
        ];

        let ranked = rank(recipes, &wanted).unwrap();
        let order: Vec<(u32, i64)> = ranked.iter().map(|s| (s.score, s.recipe.id)).collect();
        assert_eq!(order, vec![(3, 2), (2, 4), (1, 1), (1, 3)]);
    }

    #[test]
    fn test_rank_with_no_wanted_scores_zero() {
        let ranked = rank(vec![recipe(1, &["a"]), recipe(2, &["b"])], &BTreeSet::new()).unwrap();
        assert!(ranked.iter().all(|s| s.score == 0));
        assert_eq!(ranked[0].recipe.id, 1);
    }

    #[tokio::test]
    async fn test_garlic_ginger_ranking() {
        let (finder, created) = finder_with(vec![("A", vec!["garlic", "ginger"]), ("B", vec!["garlic"])]).await;

        let ranked = finder.find_and_score(&names(&["garlic", "ginger"]), None).await.unwrap();
        let order: Vec<(u32, i64)> = ranked.iter().map(|s| (s.score, s.recipe.id)).collect();
        assert_eq!(order, vec![(2, created[0].id), (1, created[1].id)]);
    }

    #[tokio::test]
    async fn test_results_are_bounded_and_sorted() {
        let (finder, _) = finder_with(vec![
            ("Stir fry", vec!["garlic", "ginger", "soy sauce"]),
            ("Garlic bread", vec!["bread", "garlic", "butter"]),
            ("Ginger tea", vec!["ginger", "honey"]),
            ("Toast", vec!["bread", "butter"]),
            ("Soup", vec!["leek"]),
        ])
        .await;

        let wanted = names(&["garlic", "ginger", "butter"]);
        let ranked = finder.find_and_score(&wanted, None).await.unwrap();

        assert_eq!(ranked.len(), 4);
        for scored in &ranked {
            assert!(scored.score > 0, "{} scored 0", scored.recipe.name);
            assert!(scored.score as usize <= wanted.len());
        }
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(ranked.iter().all(|s| s.recipe.name != "Soup"));
    }

    #[tokio::test]
    async fn test_scored_recipes_carry_full_ingredient_lists() {
        let (finder, _) = finder_with(vec![("Brine", vec!["salt", "kosher salt", "water"])]).await;

        let ranked = finder.find_and_score(&names(&["salt"]), None).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 1);
        assert_eq!(ranked[0].recipe.ingredients.len(), 3);
    }

    #[tokio::test]
    async fn test_exclusion_removes_matching_recipes() {
        let (finder, created) = finder_with(vec![("A", vec!["garlic", "ginger"]), ("B", vec!["garlic"])]).await;

        let excluded: HashSet<i64> = [created[0].id, 999].into_iter().collect();
        let ranked = finder
            .find_and_score(&names(&["garlic", "ginger"]), Some(&excluded))
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].recipe.id, created[1].id);
    }

    #[tokio::test]
    async fn test_exact_filter_misses_substring_only_recipes() {
        let (finder, _) = finder_with(vec![("Roast", vec!["garlic cloves", "potatoes"])]).await;

        let ranked = finder.find_and_score(&names(&["garlic"]), None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_returns_everything_with_zero_score() {
        let (finder, created) = finder_with(vec![("A", vec!["garlic"]), ("B", vec!["leek"])]).await;

        let ranked = finder.find_and_score(&BTreeSet::new(), None).await.unwrap();
        let order: Vec<(u32, i64)> = ranked.iter().map(|s| (s.score, s.recipe.id)).collect();
        assert_eq!(order, vec![(0, created[0].id), (0, created[1].id)]);
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let (finder, _) = finder_with(vec![("A", vec!["garlic"])]).await;
        let ranked = finder.find_and_score(&names(&["saffron"]), None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_an_error() {
        let store = Arc::new(SqliteRecipeStore::in_memory().await.unwrap());
        store.close().await;
        let finder = RecipeFinder::new(store);

        let result = finder.find_and_score(&names(&["garlic"]), None).await;
        assert!(matches!(result, Err(RecipeError::Storage(_))), "got: {:?}", result);
    }
}
