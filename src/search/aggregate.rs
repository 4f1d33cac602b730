/// Folding joined (recipe, ingredient) rows back into whole recipes.

use std::collections::HashMap;

use crate::store::{JoinedRow, Recipe};

/// Merge joined rows into one Recipe per distinct recipe id.
///
/// The first row seen for an id supplies the recipe's scalar fields; every
/// later row for that id only contributes its ingredient. Recipes come out in
/// first-seen order and each ingredient list keeps row order. Rows for one
/// recipe need not be contiguous.
pub fn aggregate<I>(rows: I) -> Vec<Recipe>
where
    I: IntoIterator<Item = JoinedRow>,
{
    let mut recipes: Vec<Recipe> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();

    for row in rows {
        match index.get(&row.recipe_id).copied() {
            Some(pos) => recipes[pos].ingredients.push(row.ingredient),
            None => {
                index.insert(row.recipe_id, recipes.len());
                recipes.push(row.into_recipe());
            }
        }
    }

    recipes
}
