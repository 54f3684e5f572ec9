//! Betting Odds CRUD API v1.0
//!
//! Stores betting odds records (league, teams, three-way odds, game date)
//! in a file-backed SQLite table and exposes create/read/update/delete
//! endpoints guarded by a static API key.
//!
//! Security notes:
//! - Reads the API key from a secret file once at startup
//! - The key is compared verbatim against the `x-api-key` header
//! - Health endpoint is mounted outside the key check

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::env;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// A persisted odds record for one fixture.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Odd {
    pub id: i64,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub home_team_win_odds: f64,
    pub away_team_win_odds: f64,
    pub draw_odds: f64,
    pub game_date: NaiveDate,
}

/// The seven writable fields of a record, as accepted by create and update.
#[derive(Debug, Clone)]
pub struct OddFields {
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub home_team_win_odds: f64,
    pub away_team_win_odds: f64,
    pub draw_odds: f64,
    pub game_date: NaiveDate,
}

/// Create/update request body. Odds accept any JSON number; the date is
/// parsed separately so a bad date surfaces as a payload error.
#[derive(Debug, Deserialize)]
pub struct OddPayload {
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub home_team_win_odds: f64,
    pub away_team_win_odds: f64,
    pub draw_odds: f64,
    pub game_date: String,
}

/// Read request body: exact league match plus an inclusive date range.
#[derive(Debug, Deserialize)]
pub struct ReadPayload {
    pub league: String,
    pub date_range: Vec<String>,
}

/// Delete request body: the match tuple identifying a record. Odds fields
/// are not required and extras are ignored.
#[derive(Debug, Deserialize)]
pub struct DeletePayload {
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub game_date: String,
}

/// Configuration
#[derive(Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub database_url: String,
    pub api_key: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_key_file =
            env::var("API_KEY_FILE").unwrap_or_else(|_| "api.key".to_string());
        let api_key = read_secret_file(&api_key_file)?;
        if api_key.is_empty() {
            return Err(anyhow!("API key file {} is empty", api_key_file));
        }

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://odds.db?mode=rwc".to_string()),
            api_key,
        })
    }
}

/// Read a secret from a local file - REQUIRED, no fallbacks
fn read_secret_file(file_path: &str) -> Result<String> {
    std::fs::read_to_string(file_path)
        .map(|s| s.trim().to_string())
        .context(format!(
            "API key file not found at {}. Create it with the shared key before starting.",
            file_path
        ))
}

/// API error taxonomy with HTTP status mapping.
///
/// Payload and database faults both flatten to 500 with an empty body to
/// keep the wire contract; the distinction only feeds the logs.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Valid Api key required")]
    Unauthorized,
    #[error("record not found")]
    NotFound,
    #[error("bad payload: {0}")]
    BadPayload(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::FORBIDDEN,
                Json(json!({ "message": "Valid Api key required" })),
            )
                .into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::BadPayload(cause) => {
                warn!("Rejected payload: {}", cause);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            ApiError::Database(e) => {
                error!("Database error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Shared handler context: one store handle plus the loaded API key.
#[derive(Clone)]
pub struct AppState {
    pub store: OddsStore,
    pub api_key: String,
}

/// Data access for the `odds` table.
#[derive(Clone)]
pub struct OddsStore {
    pool: SqlitePool,
}

impl OddsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS odds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                league TEXT NOT NULL,
                home_team TEXT NOT NULL,
                away_team TEXT NOT NULL,
                home_team_win_odds REAL NOT NULL,
                away_team_win_odds REAL NOT NULL,
                draw_odds REAL NOT NULL,
                game_date TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a new record and return it with the assigned id.
    pub async fn insert(&self, fields: &OddFields) -> Result<Odd, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO odds (
                league, home_team, away_team,
                home_team_win_odds, away_team_win_odds, draw_odds, game_date
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&fields.league)
        .bind(&fields.home_team)
        .bind(&fields.away_team)
        .bind(fields.home_team_win_odds)
        .bind(fields.away_team_win_odds)
        .bind(fields.draw_odds)
        .bind(fields.game_date)
        .execute(&self.pool)
        .await?;

        Ok(Odd {
            id: result.last_insert_rowid(),
            league: fields.league.clone(),
            home_team: fields.home_team.clone(),
            away_team: fields.away_team.clone(),
            home_team_win_odds: fields.home_team_win_odds,
            away_team_win_odds: fields.away_team_win_odds,
            draw_odds: fields.draw_odds,
            game_date: fields.game_date,
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<Odd>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM odds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Records with an exact league match and game_date within [from, to].
    /// Dates are ISO text in the table, so the range comparison is correct
    /// lexically. Ordered by id (insertion order).
    pub async fn list_by_league(
        &self,
        league: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Odd>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM odds
            WHERE league = ? AND game_date >= ? AND game_date <= ?
            ORDER BY id
            "#,
        )
        .bind(league)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
    }

    /// Overwrite all seven fields of the record with the given id.
    /// Returns None when no such record exists.
    pub async fn update(
        &self,
        id: i64,
        fields: &OddFields,
    ) -> Result<Option<Odd>, sqlx::Error> {
        if self.get(id).await?.is_none() {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE odds SET
                league = ?, home_team = ?, away_team = ?,
                home_team_win_odds = ?, away_team_win_odds = ?,
                draw_odds = ?, game_date = ?
            WHERE id = ?
            "#,
        )
        .bind(&fields.league)
        .bind(&fields.home_team)
        .bind(&fields.away_team)
        .bind(fields.home_team_win_odds)
        .bind(fields.away_team_win_odds)
        .bind(fields.draw_odds)
        .bind(fields.game_date)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(Some(Odd {
            id,
            league: fields.league.clone(),
            home_team: fields.home_team.clone(),
            away_team: fields.away_team.clone(),
            home_team_win_odds: fields.home_team_win_odds,
            away_team_win_odds: fields.away_team_win_odds,
            draw_odds: fields.draw_odds,
            game_date: fields.game_date,
        }))
    }

    /// Delete the first (lowest id) record matching the full tuple and
    /// return it. Duplicate tuples are permitted in the table, so only the
    /// earliest match goes.
    pub async fn delete_first_match(
        &self,
        league: &str,
        home_team: &str,
        away_team: &str,
        game_date: NaiveDate,
    ) -> Result<Option<Odd>, sqlx::Error> {
        let found: Option<Odd> = sqlx::query_as(
            r#"
            SELECT * FROM odds
            WHERE league = ? AND home_team = ? AND away_team = ? AND game_date = ?
            ORDER BY id LIMIT 1
            "#,
        )
        .bind(league)
        .bind(home_team)
        .bind(away_team)
        .bind(game_date)
        .fetch_optional(&self.pool)
        .await?;

        let Some(odd) = found else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM odds WHERE id = ?")
            .bind(odd.id)
            .execute(&self.pool)
            .await?;

        Ok(Some(odd))
    }
}

/// Parse raw body bytes into a typed payload. The handler reads the body
/// itself so that a malformed request never bounces off an extractor with
/// a status outside the documented contract.
fn parse_payload<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadPayload(e.to_string()))
}

fn parse_game_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| ApiError::BadPayload(format!("invalid game_date {:?}: {}", raw, e)))
}

impl OddPayload {
    fn into_fields(self) -> Result<OddFields, ApiError> {
        let game_date = parse_game_date(&self.game_date)?;
        Ok(OddFields {
            league: self.league,
            home_team: self.home_team,
            away_team: self.away_team,
            home_team_win_odds: self.home_team_win_odds,
            away_team_win_odds: self.away_team_win_odds,
            draw_odds: self.draw_odds,
            game_date,
        })
    }
}

/// Explicit field-by-field record serialization. The response shape is part
/// of the contract, so it is written out by hand rather than derived.
fn odd_to_json(odd: &Odd) -> Value {
    json!({
        "id": odd.id,
        "league": odd.league,
        "home_team": odd.home_team,
        "away_team": odd.away_team,
        "home_team_win_odds": odd.home_team_win_odds,
        "away_team_win_odds": odd.away_team_win_odds,
        "draw_odds": odd.draw_odds,
        "game_date": odd.game_date.format("%Y-%m-%d").to_string(),
    })
}

/// API key guard layered over the CRUD routes. Missing or wrong key gets
/// the fixed 403 body before any handler runs.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(key) if key == state.api_key => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}

/// POST /create - insert a record, echo it back with the assigned id
async fn create_odd(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: OddPayload = parse_payload(&body)?;
    let fields = payload.into_fields()?;

    let odd = state.store.insert(&fields).await?;
    info!(
        "Created odd {} ({} vs {} on {})",
        odd.id, odd.home_team, odd.away_team, odd.game_date
    );

    Ok(Json(odd_to_json(&odd)))
}

/// POST /read - records for a league with game_date in an inclusive range
async fn read_odds(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: ReadPayload = parse_payload(&body)?;
    if payload.date_range.len() < 2 {
        return Err(ApiError::BadPayload(format!(
            "date_range needs [from, to], got {} element(s)",
            payload.date_range.len()
        )));
    }
    let from = parse_game_date(&payload.date_range[0])?;
    let to = parse_game_date(&payload.date_range[1])?;

    let odds = state.store.list_by_league(&payload.league, from, to).await?;
    let results: Vec<Value> = odds.iter().map(odd_to_json).collect();

    Ok(Json(Value::Array(results)))
}

/// PUT /update/:id - overwrite all fields of an existing record
async fn update_odd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    // A non-numeric id cannot name a record
    let id: i64 = id.parse().map_err(|_| ApiError::NotFound)?;

    let payload: OddPayload = parse_payload(&body)?;
    let fields = payload.into_fields()?;

    let odd = state
        .store
        .update(id, &fields)
        .await?
        .ok_or(ApiError::NotFound)?;
    info!("Updated odd {}", odd.id);

    Ok(Json(odd_to_json(&odd)))
}

/// DELETE /delete - remove the first record matching the full tuple
async fn delete_odd(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: DeletePayload = parse_payload(&body)?;
    let game_date = parse_game_date(&payload.game_date)?;

    let odd = state
        .store
        .delete_first_match(
            &payload.league,
            &payload.home_team,
            &payload.away_team,
            game_date,
        )
        .await?
        .ok_or(ApiError::NotFound)?;
    info!("Deleted odd {}", odd.id);

    Ok(Json(odd_to_json(&odd)))
}

/// Health check handler
async fn health_handler() -> Json<Value> {
    Json(json!({
        "service": "odds-api",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok"
    }))
}

/// Build the router: CRUD routes behind the key guard, health outside it.
fn app_router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/create", post(create_odd))
        .route("/read", post(read_odds))
        .route("/update/:id", put(update_odd))
        .route("/delete", delete(delete_odd))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(guarded)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("odds_api=info".parse().unwrap()),
        )
        .init();

    info!("Betting Odds CRUD API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to open sqlite database")?;
    info!("Connected to {}", config.database_url);

    let store = OddsStore::new(pool);
    store
        .init_schema()
        .await
        .context("Failed to initialize schema")?;

    let state = AppState {
        store,
        api_key: config.api_key.clone(),
    };
    let app = app_router(state);

    let addr = format!("{}:{}", config.bind_addr, config.port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
