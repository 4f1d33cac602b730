use rmcp::{
    ServerHandler,
    tool,
    model::{
        ServerCapabilities, Implementation, ProtocolVersion, CallToolResult,
        RawResource, ListResourcesResult, ReadResourceResult, ResourceContents,
        ReadResourceRequestParams, AnnotateAble,
    },
    handler::server::wrapper::Parameters,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;

use crate::errors::RecipeError;
use crate::search::RecipeFinder;
use crate::store::{Ingredient, NewRecipe, Recipe, RecipeQuery, RecipeStore};

const CATALOG_URI: &str = "recipes://catalog";

pub struct RecipeService {
    store: Arc<dyn RecipeStore + Send + Sync>,
    finder: RecipeFinder,
    start_time: Instant,
}

impl RecipeService {
    pub fn new(store: Arc<dyn RecipeStore + Send + Sync>) -> Self {
        Self {
            finder: RecipeFinder::new(store.clone()),
            store,
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// Parameter structs

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct CreateRecipeParams {
    /// Recipe name (required)
    pub name: String,
    /// Recipe author (required)
    pub author: String,
    /// Rating, e.g. 1-10 (optional)
    pub rating: Option<i64>,
    /// Preparation time in minutes (optional)
    pub prep_time: Option<f64>,
    /// Cooking time in minutes (optional)
    pub cook_time: Option<f64>,
    /// Preparation steps (optional)
    pub instructions: Option<String>,
    /// Ingredient list in order (required, may be empty)
    pub ingredients: Vec<Ingredient>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetRecipeParams {
    /// Recipe ID to retrieve (required)
    pub id: i64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct UpdateRecipeParams {
    /// Recipe ID to update (required)
    pub id: i64,
    /// New name (required)
    pub name: String,
    /// New author (required)
    pub author: String,
    pub rating: Option<i64>,
    pub prep_time: Option<f64>,
    pub cook_time: Option<f64>,
    pub instructions: Option<String>,
    /// Full replacement ingredient list (required)
    pub ingredients: Vec<Ingredient>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct DeleteRecipeParams {
    /// Recipe ID to delete (required)
    pub id: i64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct SearchRecipesParams {
    /// Exact recipe name (optional)
    pub name: Option<String>,
    /// Exact author (optional)
    pub author: Option<String>,
    /// Exact ingredient names (optional)
    pub ingredients: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct FindRecipesParams {
    /// Ingredients you want to use (required)
    pub ingredients: Vec<String>,
    /// Recipe IDs to leave out of the results (optional)
    pub exclude: Option<Vec<i64>>,
    /// Maximum results to return (1-100, default: 20)
    pub limit: Option<u32>,
}

// Helper: convert RecipeError to CallToolResult with isError: true
fn store_error_to_result(err: RecipeError) -> CallToolResult {
    match err {
        RecipeError::NotFound { id } => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": format!("Recipe not found: {}", id),
                "hint": "Use list_recipes or search_recipes to find available recipe IDs"
            }))
        }
        RecipeError::Validation { message, field } => {
            let mut obj = json!({
                "isError": true,
                "error": message,
            });
            if let Some(f) = field {
                obj["field"] = json!(f);
            }
            CallToolResult::structured_error(obj)
        }
        RecipeError::Storage(msg) => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": format!("Storage error: {}", msg)
            }))
        }
        other => {
            if other.is_fatal() {
                tracing::error!(error = %other, "Fatal error while serving tool call");
            } else {
                tracing::warn!(error = %other, "Tool call failed");
            }
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": other.to_string()
            }))
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

/// Reject blank recipe names, authors and ingredient names.
fn validate_recipe_fields(name: &str, author: &str, ingredients: &[Ingredient]) -> Result<(), RecipeError> {
    if name.trim().is_empty() {
        return Err(RecipeError::validation("name", "Field 'name' is required and cannot be empty"));
    }
    if author.trim().is_empty() {
        return Err(RecipeError::validation("author", "Field 'author' is required and cannot be empty"));
    }
    if ingredients.iter().any(|i| i.name.trim().is_empty()) {
        return Err(RecipeError::validation("ingredients", "Every ingredient needs a non-empty 'name'"));
    }
    Ok(())
}

/// Trim and deduplicate requested ingredient names. Blank names would match
/// every ingredient by substring, so they are rejected.
fn wanted_ingredients(raw: Vec<String>) -> Result<BTreeSet<String>, RecipeError> {
    let mut wanted = BTreeSet::new();
    for name in raw {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(RecipeError::validation("ingredients", "Ingredient names cannot be empty"));
        }
        wanted.insert(trimmed.to_string());
    }
    Ok(wanted)
}

// Tool implementations
#[rmcp::tool_router]
impl RecipeService {
    #[tool(description = "Create a recipe with its ingredient list. Returns the stored recipe with its ID.")]
    async fn create_recipe(
        &self,
        Parameters(params): Parameters<CreateRecipeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "create_recipe",
            name = %params.name,
            ingredients = params.ingredients.len(),
            "Tool called"
        );

        if let Err(e) = validate_recipe_fields(&params.name, &params.author, &params.ingredients) {
            return Ok(store_error_to_result(e));
        }

        let input = NewRecipe {
            name: params.name,
            author: params.author,
            rating: params.rating,
            prep_time: params.prep_time,
            cook_time: params.cook_time,
            instructions: params.instructions,
            ingredients: params.ingredients,
        };

        match self.store.create(input).await {
            Ok(recipe) => {
                let mut body = to_json(&recipe)?;
                body["hint"] = json!("Use get_recipe with this ID to retrieve, or update_recipe to modify");
                Ok(CallToolResult::structured(body))
            }
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "Retrieve a recipe and its ingredients by ID.")]
    async fn get_recipe(
        &self,
        Parameters(params): Parameters<GetRecipeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "get_recipe", id = params.id, "Tool called");

        match self.store.get(params.id).await {
            Ok(Some(recipe)) => Ok(CallToolResult::structured(to_json(&recipe)?)),
            Ok(None) => Ok(store_error_to_result(RecipeError::NotFound { id: params.id })),
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "Replace a recipe's fields and its whole ingredient list.")]
    async fn update_recipe(
        &self,
        Parameters(params): Parameters<UpdateRecipeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "update_recipe",
            id = params.id,
            ingredients = params.ingredients.len(),
            "Tool called"
        );

        if let Err(e) = validate_recipe_fields(&params.name, &params.author, &params.ingredients) {
            return Ok(store_error_to_result(e));
        }

        // The store keeps created_at and stamps modified_at itself
        let now = Utc::now();
        let recipe = Recipe {
            id: params.id,
            name: params.name,
            author: params.author,
            rating: params.rating,
            prep_time: params.prep_time,
            cook_time: params.cook_time,
            instructions: params.instructions,
            ingredients: params.ingredients,
            created_at: now,
            modified_at: now,
        };

        match self.store.update(recipe).await {
            Ok(recipe) => {
                let mut body = to_json(&recipe)?;
                body["hint"] = json!("Use get_recipe to re-read or delete_recipe to remove");
                Ok(CallToolResult::structured(body))
            }
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "Delete a recipe and its ingredients by ID. This is permanent and cannot be undone.")]
    async fn delete_recipe(
        &self,
        Parameters(params): Parameters<DeleteRecipeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "delete_recipe", id = params.id, "Tool called");

        match self.store.delete(params.id).await {
            Ok(()) => Ok(CallToolResult::structured(json!({
                "deleted": true,
                "id": params.id,
                "hint": "Recipe permanently removed. Use create_recipe to add new recipes."
            }))),
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "Search recipes by exact name, author, or ingredient name. Criteria are OR-combined; no criteria lists everything.")]
    async fn search_recipes(
        &self,
        Parameters(params): Parameters<SearchRecipesParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "search_recipes",
            name = ?params.name,
            author = ?params.author,
            ingredients = params.ingredients.as_ref().map(|i| i.len()).unwrap_or(0),
            "Tool called"
        );

        let ingredients = match wanted_ingredients(params.ingredients.unwrap_or_default()) {
            Ok(set) => set,
            Err(e) => return Ok(store_error_to_result(e)),
        };
        let query = RecipeQuery {
            name: params.name,
            author: params.author,
            ingredients,
        };

        match self.store.search(&query).await {
            Ok(found) => {
                let recipes = found.unwrap_or_default();
                Ok(CallToolResult::structured(json!({
                    "recipes": to_json(&recipes)?,
                    "count": recipes.len(),
                    "hint": "Use find_recipes to rank recipes by how many of your ingredients they use"
                })))
            }
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "List every recipe in the catalog, ordered by name.")]
    async fn list_recipes(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "list_recipes", "Tool called");

        match self.store.list().await {
            Ok(recipes) => {
                Ok(CallToolResult::structured(json!({
                    "recipes": to_json(&recipes)?,
                    "count": recipes.len(),
                })))
            }
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "Find recipes that use at least one of the given ingredients, ranked by how many they use. Partial names match (\"garlic\" matches \"garlic cloves\") when scoring.")]
    async fn find_recipes(
        &self,
        Parameters(params): Parameters<FindRecipesParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "find_recipes",
            ingredients = params.ingredients.len(),
            excluded = params.exclude.as_ref().map(|e| e.len()).unwrap_or(0),
            limit = ?params.limit,
            "Tool called"
        );

        if params.ingredients.is_empty() {
            return Ok(store_error_to_result(RecipeError::validation(
                "ingredients",
                "Field 'ingredients' needs at least one ingredient name",
            )));
        }
        let wanted = match wanted_ingredients(params.ingredients) {
            Ok(set) => set,
            Err(e) => return Ok(store_error_to_result(e)),
        };
        let exclude: Option<HashSet<i64>> = params.exclude.map(|ids| ids.into_iter().collect());
        let limit = params.limit.unwrap_or(20).clamp(1, 100) as usize;

        match self.finder.find_and_score(&wanted, exclude.as_ref()).await {
            Ok(scored) => {
                let total = scored.len();
                let results = &scored[..total.min(limit)];
                Ok(CallToolResult::structured(json!({
                    "results": to_json(results)?,
                    "count": results.len(),
                    "total_matches": total,
                    "max_score": wanted.len(),
                    "hint": "Pass IDs you already planned in 'exclude' to see alternatives"
                })))
            }
            Err(e) => Ok(store_error_to_result(e)),
        }
    }

    #[tool(description = "Check server health and status")]
    async fn health_check(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "health_check", "Tool called");

        let response = json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.uptime_seconds(),
        });

        Ok(CallToolResult::structured(response))
    }
}

// Helper: format recipes into human-readable text for resource consumption
fn format_catalog_text(recipes: &[Recipe]) -> String {
    recipes
        .iter()
        .map(|r| {
            let ingredients: Vec<&str> = r.ingredients.iter().map(|i| i.name.as_str()).collect();
            format!(
                "---\n[{}] {} by {}\nIngredients: {}\n---",
                r.id,
                r.name,
                r.author,
                ingredients.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ServerHandler implementation
#[rmcp::tool_handler(router = Self::tool_router())]
impl ServerHandler for RecipeService {
    fn get_info(&self) -> rmcp::model::InitializeResult {
        rmcp::model::InitializeResult {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "recipe-alchemy".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some("Recipe catalog with ingredient-ranked search".to_string()),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Recipe catalog. Tools: create_recipe, get_recipe, update_recipe, delete_recipe, search_recipes, list_recipes, find_recipes, health_check. Resources: recipes://catalog (catalog summary).".to_string()
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            meta: None,
            resources: vec![
                RawResource {
                    uri: CATALOG_URI.to_string(),
                    name: "catalog".to_string(),
                    title: Some("Recipe Catalog".to_string()),
                    description: Some("Every recipe with its ingredient names".to_string()),
                    mime_type: Some("text/plain".to_string()),
                    size: None,
                    icons: None,
                    meta: None,
                }
                .no_annotation(),
            ],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        match request.uri.as_str() {
            CATALOG_URI => {
                let recipes = self
                    .store
                    .list()
                    .await
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;

                let text = if recipes.is_empty() {
                    "No recipes stored yet. Use create_recipe to add your first recipe.".to_string()
                } else {
                    format_catalog_text(&recipes)
                };

                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::text(text, request.uri)],
                })
            }
            uri => Err(McpError::resource_not_found(
                format!("Resource not found: {}", uri),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteRecipeStore;

    async fn test_service() -> RecipeService {
        let store = SqliteRecipeStore::in_memory().await.unwrap();
        RecipeService::new(Arc::new(store))
    }

    fn create_params(name: &str, ingredients: &[&str]) -> CreateRecipeParams {
        CreateRecipeParams {
            name: name.to_string(),
            author: "Joe".to_string(),
            rating: Some(8),
            prep_time: None,
            cook_time: None,
            instructions: None,
            ingredients: ingredients.iter().map(|n| Ingredient::named(*n)).collect(),
        }
    }

    fn body(result: &CallToolResult) -> &serde_json::Value {
        result.structured_content.as_ref().expect("structured content")
    }

    #[test]
    fn test_wanted_ingredients_trims_and_rejects_blank() {
        let wanted = wanted_ingredients(vec![" garlic ".to_string(), "garlic".to_string()]).unwrap();
        assert_eq!(wanted.len(), 1);
        assert!(wanted.contains("garlic"));

        let err = wanted_ingredients(vec!["  ".to_string()]).unwrap_err();
        assert!(matches!(err, RecipeError::Validation { .. }));
    }

    #[test]
    fn test_validate_recipe_fields() {
        assert!(validate_recipe_fields("Soup", "Ann", &[Ingredient::named("leek")]).is_ok());
        assert!(validate_recipe_fields(" ", "Ann", &[]).is_err());
        assert!(validate_recipe_fields("Soup", "", &[]).is_err());
        assert!(validate_recipe_fields("Soup", "Ann", &[Ingredient::named("")]).is_err());
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let service = test_service().await;

        let created = service
            .create_recipe(Parameters(create_params("Stir fry", &["garlic", "ginger"])))
            .await
            .unwrap();
        assert_ne!(created.is_error, Some(true));
        let id = body(&created)["id"].as_i64().unwrap();

        service
            .create_recipe(Parameters(create_params("Garlic bread", &["garlic", "bread"])))
            .await
            .unwrap();

        let found = service
            .find_recipes(Parameters(FindRecipesParams {
                ingredients: vec!["garlic".to_string(), "ginger".to_string()],
                exclude: None,
                limit: None,
            }))
            .await
            .unwrap();
        let results = body(&found)["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["score"], 2);
        assert_eq!(results[0]["recipe"]["id"].as_i64(), Some(id));
        assert_eq!(results[1]["score"], 1);
    }

    #[tokio::test]
    async fn test_update_keeps_created_at_and_rejects_unknown_id() {
        let service = test_service().await;
        let created = service
            .create_recipe(Parameters(create_params("Porridge", &["oats"])))
            .await
            .unwrap();
        let id = body(&created)["id"].as_i64().unwrap();
        let created_at = body(&created)["created_at"].clone();

        let update = |id: i64| UpdateRecipeParams {
            id,
            name: "Porridge".to_string(),
            author: "Joe".to_string(),
            rating: None,
            prep_time: None,
            cook_time: None,
            instructions: Some("Simmer".to_string()),
            ingredients: vec![Ingredient::named("oats"), Ingredient::named("milk")],
        };

        let updated = service.update_recipe(Parameters(update(id))).await.unwrap();
        assert_ne!(updated.is_error, Some(true));
        assert_eq!(body(&updated)["created_at"], created_at);
        assert_eq!(body(&updated)["instructions"], "Simmer");

        let missing = service.update_recipe(Parameters(update(id + 100))).await.unwrap();
        assert_eq!(missing.is_error, Some(true));
        assert!(body(&missing)["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_recipe_json_matches_serialized_recipe() {
        let service = test_service().await;
        let created = service
            .create_recipe(Parameters(create_params("Pancakes", &["flour", "egg"])))
            .await
            .unwrap();
        let id = body(&created)["id"].as_i64().unwrap();

        let fetched = service.get_recipe(Parameters(GetRecipeParams { id })).await.unwrap();
        let stored = service.store.get(id).await.unwrap().unwrap();
        assert_eq!(body(&fetched), &serde_json::to_value(&stored).unwrap());
    }

    #[test]
    fn test_validation_error_result_names_field() {
        let result = store_error_to_result(RecipeError::validation("author", "Field 'author' is required"));
        assert_eq!(result.is_error, Some(true));
        assert_eq!(body(&result)["field"], "author");
    }

    #[tokio::test]
    async fn test_get_missing_recipe_is_tool_error() {
        let service = test_service().await;
        let result = service.get_recipe(Parameters(GetRecipeParams { id: 5 })).await.unwrap();
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_find_requires_ingredients() {
        let service = test_service().await;
        let result = service
            .find_recipes(Parameters(FindRecipesParams {
                ingredients: vec![],
                exclude: None,
                limit: None,
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_update_replaces_and_delete_removes() {
        let service = test_service().await;
        let created = service
            .create_recipe(Parameters(create_params("Toast", &["bread"])))
            .await
            .unwrap();
        let id = body(&created)["id"].as_i64().unwrap();

        let updated = service
            .update_recipe(Parameters(UpdateRecipeParams {
                id,
                name: "Toast".to_string(),
                author: "a different author".to_string(),
                rating: None,
                prep_time: None,
                cook_time: None,
                instructions: None,
                ingredients: vec![Ingredient::named("rye bread"), Ingredient::named("butter")],
            }))
            .await
            .unwrap();
        assert_eq!(body(&updated)["author"], "a different author");
        assert_eq!(body(&updated)["ingredients"].as_array().unwrap().len(), 2);

        service.delete_recipe(Parameters(DeleteRecipeParams { id })).await.unwrap();
        let gone = service.get_recipe(Parameters(GetRecipeParams { id })).await.unwrap();
        assert_eq!(gone.is_error, Some(true));
    }
}
