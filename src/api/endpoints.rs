use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::app_context::AppContext;
use crate::codec;
use crate::error::ArchiveError;

fn error_response(err: ArchiveError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!("request failed: {err:#?}");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn filters_from_query(query: &HashMap<String, String>) -> BTreeMap<String, String> {
    query
        .iter()
        .filter(|(k, _)| k.as_str() != "days")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// GET /api/auction/:uuid: the combined view, 404 when no tier has it.
pub async fn get_auction(
    State(context): State<Arc<AppContext>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    match context.engine.combined(&uuid).await {
        Ok(Some(auction)) => (StatusCode::OK, Json(auction)).into_response(),
        Ok(None) => error_response(ArchiveError::NotFound),
        Err(err) => error_response(err),
    }
}

/// POST /api/auction/:uuid: every stored version.
pub async fn get_auction_versions(
    State(context): State<Arc<AppContext>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    match context.engine.versions(&uuid).await {
        Ok(versions) => (StatusCode::OK, Json(versions)).into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /api/auctions/tag/:tag/recent/overview: up to 12 latest sales.
pub async fn recent_overview(
    State(context): State<Arc<AppContext>>,
    Path(tag): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let filters = filters_from_query(&query);
    match context.engine.recent_overview(&tag, &filters).await {
        Ok(previews) => (StatusCode::OK, Json(previews)).into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /api/prices/item/price/:tag: windowed price summary.
pub async fn price_summary(
    State(context): State<Arc<AppContext>>,
    Path(tag): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let days: f64 = match query.get("days").map(|d| d.parse()) {
        Some(Ok(days)) => days,
        Some(Err(_)) => {
            return error_response(ArchiveError::InvalidInput(
                "days must be a number".to_string(),
            ))
        }
        None => 1.0,
    };
    let filters = filters_from_query(&query);
    match context.engine.price_summary(&tag, &filters, days).await {
        Ok(summary) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "public, max-age=1800")],
            Json(summary),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /api/prices/item/price/:tag/history: memoized daily aggregates.
pub async fn price_history(
    State(context): State<Arc<AppContext>>,
    Path(tag): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let filters = filters_from_query(&query);
    match context.engine.summary(&tag, &filters).await {
        Ok(records) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "public, max-age=180")],
            Json(records),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /api/restore/:uuid: re-insert an archived auction into the legacy
/// relational collaborator.
pub async fn restore_auction(
    State(context): State<Arc<AppContext>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    let Some(pool) = &context.sql else {
        return error_response(ArchiveError::Transient(
            "legacy database not configured".to_string(),
        ));
    };
    let auction = match context.engine.combined(&uuid).await {
        Ok(Some(auction)) => auction,
        Ok(None) => return error_response(ArchiveError::NotFound),
        Err(err) => return error_response(err),
    };

    let stored = codec::encode(&auction, Utc::now());
    let result = sqlx::query(
        r#"INSERT INTO auctions
               (uuid, tag, item_name, category, tier, bin, starting_bid,
                highest_bid_amount, seller, profile_id, "start", "end", count)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
           ON CONFLICT (uuid) DO NOTHING"#,
    )
    .bind(auction.uuid)
    .bind(&auction.tag)
    .bind(&auction.item_name)
    .bind(&auction.category)
    .bind(&auction.tier)
    .bind(auction.bin)
    .bind(auction.starting_bid)
    .bind(stored.highest_bid_amount)
    .bind(auction.seller)
    .bind(auction.profile_id)
    .bind(auction.start)
    .bind(auction.end)
    .bind(auction.count)
    .execute(pool)
    .await;

    match result {
        Ok(_) => {
            info!(%uuid, "restored auction into the legacy database");
            StatusCode::OK.into_response()
        }
        Err(err) => error_response(ArchiveError::Other(err.into())),
    }
}

/// DELETE /api/restore/:uuid: remove from the legacy collaborator once the
/// archive demonstrably holds the auction.
pub async fn delete_restored(
    State(context): State<Arc<AppContext>>,
    Path(uuid): Path<Uuid>,
) -> Response {
    let Some(pool) = &context.sql else {
        return error_response(ArchiveError::Transient(
            "legacy database not configured".to_string(),
        ));
    };
    match context.engine.versions(&uuid).await {
        Ok(versions) if versions.is_empty() => return error_response(ArchiveError::NotFound),
        Ok(_) => {}
        Err(err) => return error_response(err),
    }

    match sqlx::query("DELETE FROM auctions WHERE uuid = $1")
        .bind(uuid)
        .execute(pool)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => error_response(ArchiveError::Other(err.into())),
    }
}

#[derive(Deserialize)]
pub struct OffsetParams {
    pub id: i64,
}

/// POST /import/offset?id=N: manual checkpoint override.
pub async fn set_import_offset(
    State(context): State<Arc<AppContext>>,
    Query(params): Query<OffsetParams>,
) -> Response {
    match context.import_offset.set_and_flush(params.id).await {
        Ok(value) => (StatusCode::OK, Json(serde_json::json!({ "offset": value }))).into_response(),
        Err(err) => error_response(ArchiveError::Transient(err.to_string())),
    }
}

/// GET /api/archive/:tag/months: which months have a sealed blob.
pub async fn archive_months(
    State(context): State<Arc<AppContext>>,
    Path(tag): Path<String>,
) -> Response {
    let Some(cold) = &context.cold else {
        return (StatusCode::OK, Json(Vec::<(i32, u32)>::new())).into_response();
    };
    match cold.months(&tag).await {
        Ok(months) => (StatusCode::OK, Json(months)).into_response(),
        Err(err) => error_response(ArchiveError::Other(err)),
    }
}

/// GET /api/archive/:tag/:year/:month: one sealed month, decoded.
pub async fn archive_month(
    State(context): State<Arc<AppContext>>,
    Path((tag, year, month)): Path<(String, i32, u32)>,
) -> Response {
    if !(1..=12).contains(&month) {
        return error_response(ArchiveError::InvalidInput(format!(
            "month out of range: {month}"
        )));
    }
    let Some(cold) = &context.cold else {
        return error_response(ArchiveError::NotFound);
    };
    match cold.get_month(&tag, year, month).await {
        Ok(rows) => {
            let auctions: Vec<_> = rows.into_iter().map(codec::decode).collect();
            (StatusCode::OK, Json(auctions)).into_response()
        }
        Err(err) => error_response(ArchiveError::Other(err)),
    }
}

/// POST /api/archive/migrate: kick a migration pass off out of band.
pub async fn trigger_migration(State(context): State<Arc<AppContext>>) -> Response {
    let Some(migrator) = context.migrator.clone() else {
        return error_response(ArchiveError::Transient(
            "cold tier not configured".to_string(),
        ));
    };
    tokio::spawn(async move {
        match migrator.run_once(Utc::now()).await {
            Ok(report) => info!(?report, "manual migration pass finished"),
            Err(err) => error!("manual migration pass failed: {err:#?}"),
        }
    });
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "migration started" })),
    )
        .into_response()
}
