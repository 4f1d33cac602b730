/// PostgreSQL-backed implementation of RecipeStore
///
/// Uses sqlx with PgPool for connection pooling and production-grade persistence.
/// List filters bind whole arrays through `= ANY($n)`.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow},
    ConnectOptions, Row,
};

use crate::config::Config;
use crate::errors::RecipeError;
use crate::search::aggregate;
use crate::store::{
    recipe_ids_of, sort_for_listing, Ingredient, JoinedRow, JoinedRowFilter, NewRecipe, Recipe,
    RecipeQuery, RecipeStore,
};

const JOINED_SELECT: &str =
    "SELECT r.recipe_id, r.name, r.author, r.rating, r.prep_time, r.cook_time, r.instructions, \
     r.created_at, r.modified_at, \
     i.name AS ingredient_name, i.amount, i.unit, i.notes, i.ingredient_group \
     FROM recipe r INNER JOIN ingredient i ON i.recipe_id = r.recipe_id";

const JOINED_ORDER: &str = "ORDER BY r.recipe_id, i.ingredient_id";

/// PostgreSQL-backed recipe store using sqlx connection pool.
pub struct PostgresRecipeStore {
    pool: PgPool,
}

impl PostgresRecipeStore {
    /// Connect to the PostgreSQL database at config.database_url.
    ///
    /// If run_migrations is true, automatically runs pending migrations on startup.
    pub async fn new(config: &Config, run_migrations: bool) -> Result<Self, RecipeError> {
        let mut opts = config
            .database_url
            .parse::<PgConnectOptions>()
            .map_err(|e| RecipeError::Storage(format!("Invalid database_url: {}", e)))?;
        if !config.log_statements {
            opts = opts.disable_statement_logging();
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)                          // keep at least one warm connection
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(opts)
            .await
            .map_err(|e| RecipeError::Storage(format!("Failed to connect to database: {}", e)))?;

        if run_migrations {
            sqlx::migrate!("./migrations/postgres").run(&pool).await?;
        }

        tracing::debug!("PostgreSQL recipe store connected");
        Ok(PostgresRecipeStore { pool })
    }

    /// Wrap an existing pool. The caller is responsible for migrations.
    pub fn from_pool(pool: PgPool) -> Self {
        PostgresRecipeStore { pool }
    }
}

/// Map a recipe-table row to a Recipe with an empty ingredient list.
///
/// TIMESTAMPTZ decodes straight into DateTime<Utc>.
fn row_to_recipe(row: &PgRow) -> Result<Recipe, RecipeError> {
    Ok(Recipe {
        id: row.try_get("recipe_id")?,
        name: row.try_get("name")?,
        author: row.try_get("author")?,
        rating: row.try_get("rating")?,
        prep_time: row.try_get("prep_time")?,
        cook_time: row.try_get("cook_time")?,
        instructions: row.try_get("instructions")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        ingredients: Vec::new(),
    })
}

fn row_to_ingredient(row: &PgRow, name_column: &str) -> Result<Ingredient, RecipeError> {
    Ok(Ingredient {
        name: row.try_get(name_column)?,
        amount: row.try_get("amount")?,
        unit: row.try_get("unit")?,
        notes: row.try_get("notes")?,
        group: row.try_get("ingredient_group")?,
    })
}

fn row_to_joined(row: &PgRow) -> Result<JoinedRow, RecipeError> {
    let head = row_to_recipe(row)?;
    Ok(JoinedRow {
        recipe_id: head.id,
        name: head.name,
        author: head.author,
        rating: head.rating,
        prep_time: head.prep_time,
        cook_time: head.cook_time,
        instructions: head.instructions,
        created_at: head.created_at,
        modified_at: head.modified_at,
        ingredient: row_to_ingredient(row, "ingredient_name")?,
    })
}

// Single-statement helpers. None of these commit; callers own the transaction.

async fn insert_recipe(
    conn: &mut PgConnection,
    input: &NewRecipe,
    now: &DateTime<Utc>,
) -> Result<i64, RecipeError> {
    let row = sqlx::query(
        "INSERT INTO recipe (name, author, rating, prep_time, cook_time, instructions, created_at, modified_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING recipe_id",
    )
    .bind(&input.name)
    .bind(&input.author)
    .bind(input.rating)
    .bind(input.prep_time)
    .bind(input.cook_time)
    .bind(&input.instructions)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| RecipeError::Storage(format!("Failed to insert recipe: {}", e)))?;

    Ok(row.try_get("recipe_id")?)
}

async fn insert_ingredients(
    conn: &mut PgConnection,
    recipe_id: i64,
    ingredients: &[Ingredient],
) -> Result<(), RecipeError> {
    for ingredient in ingredients {
        sqlx::query(
            "INSERT INTO ingredient (recipe_id, name, amount, unit, notes, ingredient_group) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(recipe_id)
        .bind(&ingredient.name)
        .bind(ingredient.amount)
        .bind(&ingredient.unit)
        .bind(&ingredient.notes)
        .bind(&ingredient.group)
        .execute(&mut *conn)
        .await
        .map_err(|e| RecipeError::Storage(format!("Failed to insert ingredient: {}", e)))?;
    }
    Ok(())
}

async fn select_recipe_by_id(conn: &mut PgConnection, id: i64) -> Result<Option<Recipe>, RecipeError> {
    let row = sqlx::query(
        "SELECT recipe_id, name, author, rating, prep_time, cook_time, instructions, created_at, modified_at \
         FROM recipe WHERE recipe_id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_recipe).transpose()
}

async fn select_ingredients_by_recipe_id(
    conn: &mut PgConnection,
    recipe_id: i64,
) -> Result<Vec<Ingredient>, RecipeError> {
    let rows = sqlx::query(
        "SELECT name, amount, unit, notes, ingredient_group FROM ingredient \
         WHERE recipe_id = $1 ORDER BY ingredient_id",
    )
    .bind(recipe_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|row| row_to_ingredient(row, "name")).collect()
}

async fn select_recipe_ids_by_ingredients(
    conn: &mut PgConnection,
    names: &BTreeSet<String>,
) -> Result<Option<HashSet<i64>>, RecipeError> {
    if names.is_empty() {
        return Ok(None);
    }
    let names: Vec<String> = names.iter().cloned().collect();
    let ids: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT recipe_id FROM ingredient WHERE name = ANY($1)")
        .bind(names)
        .fetch_all(&mut *conn)
        .await?;
    Ok(Some(ids.into_iter().collect()))
}

async fn select_joined_rows(
    conn: &mut PgConnection,
    filter: &JoinedRowFilter,
) -> Result<Vec<JoinedRow>, RecipeError> {
    let rows = match filter {
        JoinedRowFilter::All => {
            let sql = format!("{} {}", JOINED_SELECT, JOINED_ORDER);
            sqlx::query(&sql).fetch_all(&mut *conn).await?
        }
        JoinedRowFilter::RecipeIds(ids) => {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let ids: Vec<i64> = ids.iter().copied().collect();
            let sql = format!("{} WHERE r.recipe_id = ANY($1) {}", JOINED_SELECT, JOINED_ORDER);
            sqlx::query(&sql).bind(ids).fetch_all(&mut *conn).await?
        }
        JoinedRowFilter::Matching { name, author, ingredient_names } => {
            // Build the OR chain with numbered PostgreSQL parameters
            let mut param_idx: u32 = 1;
            let mut conditions: Vec<String> = Vec::new();
            if name.is_some() {
                conditions.push(format!("r.name = ${}", param_idx));
                param_idx += 1;
            }
            if author.is_some() {
                conditions.push(format!("r.author = ${}", param_idx));
                param_idx += 1;
            }
            if !ingredient_names.is_empty() {
                conditions.push(format!("i.name = ANY(${})", param_idx));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", conditions.join(" OR "))
            };
            let sql = format!("{} {} {}", JOINED_SELECT, where_clause, JOINED_ORDER);

            let mut q = sqlx::query(&sql);
            if let Some(name) = name {
                q = q.bind(name);
            }
            if let Some(author) = author {
                q = q.bind(author);
            }
            if !ingredient_names.is_empty() {
                q = q.bind(ingredient_names.iter().cloned().collect::<Vec<String>>());
            }
            q.fetch_all(&mut *conn).await?
        }
    };
    rows.iter().map(row_to_joined).collect()
}

async fn update_recipe_row(
    conn: &mut PgConnection,
    recipe: &Recipe,
    now: &DateTime<Utc>,
) -> Result<(), RecipeError> {
    sqlx::query(
        "UPDATE recipe SET name = $1, author = $2, rating = $3, prep_time = $4, cook_time = $5, \
         instructions = $6, modified_at = $7 WHERE recipe_id = $8",
    )
    .bind(&recipe.name)
    .bind(&recipe.author)
    .bind(recipe.rating)
    .bind(recipe.prep_time)
    .bind(recipe.cook_time)
    .bind(&recipe.instructions)
    .bind(now)
    .bind(recipe.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| RecipeError::Storage(format!("Failed to update recipe: {}", e)))?;
    Ok(())
}

async fn delete_recipe_row(conn: &mut PgConnection, id: i64) -> Result<u64, RecipeError> {
    let result = sqlx::query("DELETE FROM recipe WHERE recipe_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

async fn delete_ingredients_of_recipe(conn: &mut PgConnection, recipe_id: i64) -> Result<(), RecipeError> {
    sqlx::query("DELETE FROM ingredient WHERE recipe_id = $1")
        .bind(recipe_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl RecipeStore for PostgresRecipeStore {
    async fn create(&self, input: NewRecipe) -> Result<Recipe, RecipeError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let id = insert_recipe(&mut tx, &input, &now).await?;
        insert_ingredients(&mut tx, id, &input.ingredients).await?;
        tx.commit().await?;

        tracing::debug!(recipe_id = id, ingredients = input.ingredients.len(), "Recipe created");

        self.get(id).await?.ok_or_else(|| {
            RecipeError::Inconsistency(format!("Recipe {} was committed but cannot be read back", id))
        })
    }

    async fn get(&self, id: i64) -> Result<Option<Recipe>, RecipeError> {
        let mut tx = self.pool.begin().await?;
        let Some(mut recipe) = select_recipe_by_id(&mut tx, id).await? else {
            return Ok(None);
        };
        recipe.ingredients = select_ingredients_by_recipe_id(&mut tx, id).await?;
        tx.commit().await?;
        Ok(Some(recipe))
    }

    async fn update(&self, recipe: Recipe) -> Result<Recipe, RecipeError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        if select_recipe_by_id(&mut tx, recipe.id).await?.is_none() {
            return Err(RecipeError::NotFound { id: recipe.id });
        }
        update_recipe_row(&mut tx, &recipe, &now).await?;
        delete_ingredients_of_recipe(&mut tx, recipe.id).await?;
        insert_ingredients(&mut tx, recipe.id, &recipe.ingredients).await?;
        tx.commit().await?;

        tracing::debug!(recipe_id = recipe.id, ingredients = recipe.ingredients.len(), "Recipe updated");

        self.get(recipe.id).await?.ok_or_else(|| {
            RecipeError::Inconsistency(format!("Recipe {} was updated but cannot be read back", recipe.id))
        })
    }

    async fn delete(&self, id: i64) -> Result<(), RecipeError> {
        let mut tx = self.pool.begin().await?;
        delete_ingredients_of_recipe(&mut tx, id).await?;
        let removed = delete_recipe_row(&mut tx, id).await?;
        tx.commit().await?;

        if removed == 0 {
            tracing::debug!(recipe_id = id, "Delete of unknown recipe ignored");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Recipe>, RecipeError> {
        let rows = self.fetch_joined_rows(&JoinedRowFilter::All).await?;
        let mut recipes = aggregate(rows);
        sort_for_listing(&mut recipes);
        Ok(recipes)
    }

    async fn search(&self, query: &RecipeQuery) -> Result<Option<Vec<Recipe>>, RecipeError> {
        let mut tx = self.pool.begin().await?;
        let matched = select_joined_rows(&mut tx, &query.to_filter()).await?;
        let ids = recipe_ids_of(&matched);
        let rows = select_joined_rows(&mut tx, &JoinedRowFilter::RecipeIds(ids)).await?;
        tx.commit().await?;

        let mut recipes = aggregate(rows);
        if recipes.is_empty() {
            return Ok(None);
        }
        sort_for_listing(&mut recipes);
        Ok(Some(recipes))
    }

    async fn find_recipe_ids_by_ingredients(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<Option<HashSet<i64>>, RecipeError> {
        let mut conn = self.pool.acquire().await?;
        select_recipe_ids_by_ingredients(&mut conn, names).await
    }

    async fn fetch_joined_rows(&self, filter: &JoinedRowFilter) -> Result<Vec<JoinedRow>, RecipeError> {
        let mut conn = self.pool.acquire().await?;
        select_joined_rows(&mut conn, filter).await
    }

    async fn fetch_rows_for_ingredients(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<Vec<JoinedRow>, RecipeError> {
        let mut tx = self.pool.begin().await?;
        let filter = match select_recipe_ids_by_ingredients(&mut tx, names).await? {
            Some(ids) => JoinedRowFilter::RecipeIds(ids),
            None => JoinedRowFilter::All,
        };
        let rows = select_joined_rows(&mut tx, &filter).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connect to the database named by RECIPE_ALCHEMY_TEST_POSTGRES_URL.
    /// Tests return early when it is unset so the suite runs without a server.
    /// Everything lives in one test since each run truncates the tables.
    async fn create_test_store() -> Option<PostgresRecipeStore> {
        let url = std::env::var("RECIPE_ALCHEMY_TEST_POSTGRES_URL").ok()?;
        let config = Config {
            database_url: url,
            max_connections: 2,
            ..Config::default()
        };
        let store = PostgresRecipeStore::new(&config, true)
            .await
            .expect("Failed to connect to test PostgreSQL");
        sqlx::query("TRUNCATE ingredient, recipe RESTART IDENTITY")
            .execute(&store.pool)
            .await
            .expect("Failed to reset tables");
        Some(store)
    }

    fn simple(name: &str, ingredients: &[&str]) -> NewRecipe {
        NewRecipe {
            name: name.to_string(),
            author: "Joe".to_string(),
            rating: Some(7),
            prep_time: None,
            cook_time: Some(12.5),
            instructions: Some("Mix.".to_string()),
            ingredients: ingredients.iter().map(|n| Ingredient::named(*n)).collect(),
        }
    }

    #[tokio::test]
    async fn test_postgres_store_round_trip() {
        let Some(store) = create_test_store().await else {
            return;
        };

        let created = store.create(simple("Stir fry", &["garlic", "ginger", "garlic"])).await.unwrap();
        assert_eq!(created.ingredients.len(), 3);
        assert_eq!(store.get(created.id).await.unwrap(), Some(created.clone()));

        let mut changed = created.clone();
        changed.ingredients = vec![Ingredient::named("tofu")];
        let updated = store.update(changed).await.unwrap();
        assert_eq!(updated.ingredients, vec![Ingredient::named("tofu")]);

        store.delete(created.id).await.unwrap();
        assert!(store.get(created.id).await.unwrap().is_none());

        // Lookup is exact match, rows cover whole recipes
        let a = store.create(simple("A", &["garlic", "ginger"])).await.unwrap();
        store.create(simple("B", &["garlic cloves"])).await.unwrap();

        let wanted: BTreeSet<String> = ["garlic".to_string()].into_iter().collect();
        let ids = store.find_recipe_ids_by_ingredients(&wanted).await.unwrap().unwrap();
        assert_eq!(ids, [a.id].into_iter().collect());

        let rows = store.fetch_rows_for_ingredients(&wanted).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.recipe_id == a.id));
    }
}
