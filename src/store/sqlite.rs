/// SQLite-backed implementation of RecipeStore
///
/// Uses sqlx with WAL mode for cross-restart persistence.
/// Timestamps are stored as RFC 3339 text.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    ConnectOptions, Row,
};

use crate::config::Config;
use crate::errors::RecipeError;
use crate::search::aggregate;
use crate::store::{
    recipe_ids_of, sort_for_listing, Ingredient, JoinedRow, JoinedRowFilter, NewRecipe, Recipe,
    RecipeQuery, RecipeStore,
};

const RECIPE_COLUMNS: &str =
    "recipe_id, name, author, rating, prep_time, cook_time, instructions, created_at, modified_at";

const JOINED_SELECT: &str =
    "SELECT r.recipe_id, r.name, r.author, r.rating, r.prep_time, r.cook_time, r.instructions, \
     r.created_at, r.modified_at, \
     i.name AS ingredient_name, i.amount, i.unit, i.notes, i.ingredient_group \
     FROM recipe r INNER JOIN ingredient i ON i.recipe_id = r.recipe_id";

const JOINED_ORDER: &str = "ORDER BY r.recipe_id, i.ingredient_id";

/// SQLite-backed recipe store using sqlx connection pool.
pub struct SqliteRecipeStore {
    pool: SqlitePool,
}

impl SqliteRecipeStore {
    /// Open (or create) the database named by config.database_url.
    ///
    /// Enables WAL mode and foreign keys. Runs pending migrations when
    /// run_migrations is true.
    pub async fn new(config: &Config, run_migrations: bool) -> Result<Self, RecipeError> {
        let db_path = config.database_url.as_str();
        // Strip "sqlite://" prefix if present for SqliteConnectOptions
        let path = db_path.strip_prefix("sqlite://").unwrap_or(db_path);

        let mut opts = path
            .parse::<SqliteConnectOptions>()
            .map_err(|e| RecipeError::Storage(format!("Invalid database_url '{}': {}", db_path, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        if !config.log_statements {
            opts = opts.disable_statement_logging();
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| RecipeError::Storage(format!("Failed to connect to database: {}", e)))?;

        if run_migrations {
            sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        }

        tracing::debug!(database_url = %db_path, "SQLite recipe store opened");
        Ok(SqliteRecipeStore { pool })
    }

    /// Wrap an existing pool. The caller is responsible for migrations.
    pub fn from_pool(pool: SqlitePool) -> Self {
        SqliteRecipeStore { pool }
    }

    /// In-memory store on a single connection, migrated and ready.
    pub async fn in_memory() -> Result<Self, RecipeError> {
        let opts = "sqlite::memory:"
            .parse::<SqliteConnectOptions>()?
            .foreign_keys(true);
        // One connection: every pooled connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        Ok(SqliteRecipeStore { pool })
    }
}

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>, RecipeError> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| RecipeError::Storage(format!("Parse {} '{}': {}", column, raw, e)))
}

/// Map a recipe-table row to a Recipe with an empty ingredient list.
fn row_to_recipe(row: &SqliteRow) -> Result<Recipe, RecipeError> {
    let created_at: String = row.try_get("created_at")?;
    let modified_at: String = row.try_get("modified_at")?;
    Ok(Recipe {
        id: row.try_get("recipe_id")?,
        name: row.try_get("name")?,
        author: row.try_get("author")?,
        rating: row.try_get("rating")?,
        prep_time: row.try_get("prep_time")?,
        cook_time: row.try_get("cook_time")?,
        instructions: row.try_get("instructions")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        modified_at: parse_timestamp(&modified_at, "modified_at")?,
        ingredients: Vec::new(),
    })
}

fn row_to_ingredient(row: &SqliteRow, name_column: &str) -> Result<Ingredient, RecipeError> {
    Ok(Ingredient {
        name: row.try_get(name_column)?,
        amount: row.try_get("amount")?,
        unit: row.try_get("unit")?,
        notes: row.try_get("notes")?,
        group: row.try_get("ingredient_group")?,
    })
}

fn row_to_joined(row: &SqliteRow) -> Result<JoinedRow, RecipeError> {
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

/// Encode a value list as one JSON array bind, expanded in SQL with
/// `json_each(?)`. Keeps every statement at a fixed parameter count
/// regardless of SQLite's host-parameter limit.
fn json_list<T: serde::Serialize>(values: impl IntoIterator<Item = T>) -> Result<String, RecipeError> {
    let values: Vec<T> = values.into_iter().collect();
    serde_json::to_string(&values)
        .map_err(|e| RecipeError::Inconsistency(format!("Encode bind list: {}", e)))
}

// Single-statement helpers. None of these commit; callers own the transaction.

async fn insert_recipe(
    conn: &mut SqliteConnection,
    input: &NewRecipe,
    now: &DateTime<Utc>,
) -> Result<i64, RecipeError> {
    let now_str = now.to_rfc3339();
    let result = sqlx::query(
        "INSERT INTO recipe (name, author, rating, prep_time, cook_time, instructions, created_at, modified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&input.name)
    .bind(&input.author)
    .bind(input.rating)
    .bind(input.prep_time)
    .bind(input.cook_time)
    .bind(&input.instructions)
    .bind(&now_str)
    .bind(&now_str)
    .execute(&mut *conn)
    .await
    .map_err(|e| RecipeError::Storage(format!("Failed to insert recipe: {}", e)))?;

    Ok(result.last_insert_rowid())
}

async fn insert_ingredients(
    conn: &mut SqliteConnection,
    recipe_id: i64,
    ingredients: &[Ingredient],
) -> Result<(), RecipeError> {
    for ingredient in ingredients {
        sqlx::query(
            "INSERT INTO ingredient (recipe_id, name, amount, unit, notes, ingredient_group) \
             VALUES (?, ?, ?, ?, ?, ?)",
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

async fn select_recipe_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<Recipe>, RecipeError> {
    let sql = format!("SELECT {} FROM recipe WHERE recipe_id = ?", RECIPE_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_recipe).transpose()
}

async fn select_ingredients_by_recipe_id(
    conn: &mut SqliteConnection,
    recipe_id: i64,
) -> Result<Vec<Ingredient>, RecipeError> {
    let rows = sqlx::query(
        "SELECT name, amount, unit, notes, ingredient_group FROM ingredient \
         WHERE recipe_id = ? ORDER BY ingredient_id",
    )
    .bind(recipe_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|row| row_to_ingredient(row, "name")).collect()
}

async fn select_recipe_ids_by_ingredients(
    conn: &mut SqliteConnection,
    names: &BTreeSet<String>,
) -> Result<Option<HashSet<i64>>, RecipeError> {
    if names.is_empty() {
        return Ok(None);
    }
    let rows = sqlx::query(
        "SELECT DISTINCT recipe_id FROM ingredient \
         WHERE name IN (SELECT value FROM json_each(?))",
    )
    .bind(json_list(names)?)
    .fetch_all(&mut *conn)
    .await?;

    let mut ids = HashSet::with_capacity(rows.len());
    for row in &rows {
        ids.insert(row.try_get::<i64, _>("recipe_id")?);
    }
    Ok(Some(ids))
}

async fn select_joined_rows(
    conn: &mut SqliteConnection,
    filter: &JoinedRowFilter,
) -> Result<Vec<JoinedRow>, RecipeError> {
    let mut conditions: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    match filter {
        JoinedRowFilter::All => {}
        JoinedRowFilter::RecipeIds(ids) => {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            conditions.push("r.recipe_id IN (SELECT value FROM json_each(?))".to_string());
            binds.push(json_list(ids)?);
        }
        JoinedRowFilter::Matching { name, author, ingredient_names } => {
            if let Some(name) = name {
                conditions.push("r.name = ?".to_string());
                binds.push(name.clone());
            }
            if let Some(author) = author {
                conditions.push("r.author = ?".to_string());
                binds.push(author.clone());
            }
            if !ingredient_names.is_empty() {
                conditions.push("i.name IN (SELECT value FROM json_each(?))".to_string());
                binds.push(json_list(ingredient_names)?);
            }
        }
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" OR "))
    };
    let sql = format!("{} {} {}", JOINED_SELECT, where_clause, JOINED_ORDER);

    let mut q = sqlx::query(&sql);
    for bind in binds {
        q = q.bind(bind);
    }
    let rows = q.fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_joined).collect()
}

async fn update_recipe_row(
    conn: &mut SqliteConnection,
    recipe: &Recipe,
    now: &DateTime<Utc>,
) -> Result<(), RecipeError> {
    sqlx::query(
        "UPDATE recipe SET name = ?, author = ?, rating = ?, prep_time = ?, cook_time = ?, \
         instructions = ?, modified_at = ? WHERE recipe_id = ?",
    )
    .bind(&recipe.name)
    .bind(&recipe.author)
    .bind(recipe.rating)
    .bind(recipe.prep_time)
    .bind(recipe.cook_time)
    .bind(&recipe.instructions)
    .bind(now.to_rfc3339())
    .bind(recipe.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| RecipeError::Storage(format!("Failed to update recipe: {}", e)))?;
    Ok(())
}

async fn delete_recipe_row(conn: &mut SqliteConnection, id: i64) -> Result<u64, RecipeError> {
    let result = sqlx::query("DELETE FROM recipe WHERE recipe_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

async fn delete_ingredients_of_recipe(conn: &mut SqliteConnection, recipe_id: i64) -> Result<(), RecipeError> {
    sqlx::query("DELETE FROM ingredient WHERE recipe_id = ?")
        .bind(recipe_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl RecipeStore for SqliteRecipeStore {
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
