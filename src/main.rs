use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use recipe_alchemy::config::{Backend, Config};
use recipe_alchemy::logging;
use recipe_alchemy::search::RecipeFinder;
use recipe_alchemy::server::RecipeService;
use recipe_alchemy::store::{NewRecipe, RecipeStore};
use recipe_alchemy::store::postgres::PostgresRecipeStore;
use recipe_alchemy::store::sqlite::SqliteRecipeStore;
use rmcp::ServiceExt;

#[derive(Parser)]
#[command(name = "recipe-alchemy", version, about = "Recipe catalog MCP server with ingredient-ranked search")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Skip automatic database migration on startup
    #[arg(long)]
    skip_migrate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations and exit
    Migrate,
    /// Load recipes from a JSON array file into the catalog
    Import {
        /// Path to a JSON file holding an array of recipes
        file: PathBuf,
    },
    /// Rank recipes by the given ingredients and print the result as JSON
    Find {
        /// Ingredient to look for (repeatable)
        #[arg(long = "ingredient", short = 'i')]
        ingredients: Vec<String>,
        /// Recipe ID to leave out (repeatable)
        #[arg(long)]
        exclude: Vec<i64>,
    },
}

/// Open the store selected by the database URL scheme.
async fn open_store(config: &Config, run_migrations: bool) -> Result<Arc<dyn RecipeStore + Send + Sync>> {
    let store: Arc<dyn RecipeStore + Send + Sync> = match config.backend()? {
        Backend::Sqlite => Arc::new(SqliteRecipeStore::new(config, run_migrations).await?),
        Backend::Postgres => Arc::new(PostgresRecipeStore::new(config, run_migrations).await?),
    };
    Ok(store)
}

async fn import_recipes(store: &Arc<dyn RecipeStore + Send + Sync>, file: &PathBuf) -> Result<usize> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let recipes: Vec<NewRecipe> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of recipes", file.display()))?;

    let total = recipes.len();
    for (index, recipe) in recipes.into_iter().enumerate() {
        let name = recipe.name.clone();
        store
            .create(recipe)
            .await
            .with_context(|| format!("Failed to import recipe #{} ({})", index, name))?;
    }
    Ok(total)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        Config::default()
    });

    // 3. Initialize logging before any other output.
    // stdout is reserved for JSON-RPC.
    logging::init_logging(&config);

    let run_migrations = !cli.skip_migrate;

    match cli.command {
        Some(Commands::Migrate) => {
            tracing::info!("Running database migrations...");
            let store = open_store(&config, true)
                .await
                .context("Failed to connect and run migrations")?;
            store.close().await;
            println!("Migrations completed successfully.");
        }

        Some(Commands::Import { file }) => {
            let store = open_store(&config, run_migrations)
                .await
                .context("Failed to connect to database")?;
            let result = import_recipes(&store, &file).await;
            store.close().await;
            let count = result?;
            println!("Imported {} recipes from {}.", count, file.display());
        }

        Some(Commands::Find { ingredients, exclude }) => {
            let store = open_store(&config, run_migrations)
                .await
                .context("Failed to connect to database")?;
            let wanted: BTreeSet<String> = ingredients
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            let exclude: HashSet<i64> = exclude.into_iter().collect();

            let finder = RecipeFinder::new(store.clone());
            let result = finder.find_and_score(&wanted, Some(&exclude)).await;
            store.close().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }

        None => {
            // Default: start the MCP server
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "recipe-alchemy server starting"
            );

            let store = open_store(&config, run_migrations)
                .await
                .context("Failed to initialize database")?;

            let backend = config.backend()?;
            tracing::info!(backend = ?backend, "Recipe store initialized");

            let service = RecipeService::new(store.clone());

            // Serve via stdio transport
            let (stdin, stdout) = rmcp::transport::io::stdio();
            let server = service.serve((stdin, stdout)).await?;

            tracing::info!("recipe-alchemy server running, awaiting tool calls via stdio");

            // Wait for shutdown (client disconnects or signal)
            let waited = server.waiting().await;
            store.close().await;
            waited?;

            tracing::info!("recipe-alchemy server stopped");
        }
    }

    Ok(())
}
