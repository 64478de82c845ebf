//! HTTP surface: JSON status/history feeds and the HTML dashboard

use crate::debounce::Phase;
use crate::history::ProbeRecord;
use crate::status::{HostStatus, StatusReader};
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 10_000;

pub struct AppState {
    pub reader: StatusReader,
    pub dashboard_refresh: Duration,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: Vec<HostStatus>,
    last_updated: DateTime<Utc>,
}

#[derive(Serialize)]
struct HistoryResponse {
    address: String,
    records: Vec<ProbeRecord>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "OK".into(),
    })
}

pub async fn api_status(data: web::Data<AppState>) -> impl Responder {
    let status = data.reader.status().await;
    debug!("Returning status for {} hosts", status.len());

    HttpResponse::Ok().json(StatusResponse {
        status,
        last_updated: Utc::now(),
    })
}

pub async fn api_history(
    data: web::Data<AppState>,
    address: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let address = address.into_inner();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    match data.reader.history(&address, limit).await {
        Some(records) => HttpResponse::Ok().json(HistoryResponse { address, records }),
        None => {
            info!("History requested for unknown host {}", address);
            HttpResponse::NotFound().json("Host not monitored")
        }
    }
}

pub async fn dashboard(data: web::Data<AppState>) -> impl Responder {
    let rows = data.reader.status().await;
    let window_minutes = data.reader.uptime_window().as_secs() / 60;

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_dashboard(
            &rows,
            data.dashboard_refresh,
            window_minutes,
            Utc::now(),
        ))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(dashboard))
        .route("/health", web::get().to(health_check))
        .route("/api/status", web::get().to(api_status))
        .route("/api/history/{address}", web::get().to(api_history));
}

/// Serve until the server future is dropped
pub async fn serve(state: AppState, bind: &str) -> std::io::Result<()> {
    let data = web::Data::new(state);
    info!("Dashboard listening on http://{}", bind);

    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .disable_signals()
        .bind(bind)?
        .run()
        .await
}

fn render_dashboard(
    rows: &[HostStatus],
    refresh: Duration,
    window_minutes: u64,
    now: DateTime<Utc>,
) -> String {
    let mut html = String::new();
    let down = rows.iter().filter(|r| r.reachable == Some(false)).count();

    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"{}\">\
         <title>Host status ({} down)</title>\
         <style>body{{font-family:sans-serif}}td,th{{padding:4px 10px;text-align:left}}\
         .down{{background:#f8d7da}}.up{{background:#d4edda}}.pending{{background:#fff3cd}}</style>\
         </head><body><h1>Host status</h1>\
         <p>{} of {} hosts down. Last updated {}.</p>\
         <table><tr><th>Host</th><th>Address</th><th>State</th><th>Latency</th>\
         <th>Uptime ({}m)</th><th>Last change</th></tr>\n",
        refresh.as_secs().max(1),
        down,
        down,
        rows.len(),
        now.format("%Y-%m-%d %H:%M:%S UTC"),
        window_minutes,
    );

    for row in rows {
        let (class, label) = match row.reachable {
            Some(false) => ("down", "DOWN"),
            Some(true) => ("up", "UP"),
            None => ("", "UNKNOWN"),
        };
        let detail = match row.phase {
            Phase::DownPending => " <small class=\"pending\">failing</small>",
            _ => "",
        };
        let latency = row
            .latency_ms
            .map(|ms| format!("{:.1} ms", ms))
            .unwrap_or_else(|| "-".to_string());

        let _ = writeln!(
            html,
            "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}{}</td><td>{}</td><td>{:.2}%</td><td>{}</td></tr>",
            class,
            escape_html(&row.hostname),
            escape_html(&row.address),
            label,
            detail,
            latency,
            row.uptime_ratio,
            escape_html(&row.last_change),
        );
    }

    html.push_str("</table></body></html>\n");
    html
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
