//! # cfx-cli — command line for the CONFLUX hub
//!
//! - `cfx query "<dsl>"` — Run one logical query and print the page.
//! - `cfx query "<dsl> SCROLL 1m" --follow` — Keep echoing cursors until done.
//! - `cfx backends` — List registered backends.
//! - `cfx health` — Hub liveness.

use std::collections::BTreeSet;

use cfx_core::{PageResponse, ResultTableOptions, RowMap};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::Style;

/// CONFLUX: one logical query across many storage backends.
#[derive(Parser)]
#[command(name = "cfx", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a federated query.
    Query {
        query: String,

        /// Tenant the table routes are resolved for.
        #[arg(long)]
        tenant: Option<String>,

        /// Keep fetching pages, echoing cursors, until every slice is done.
        #[arg(long)]
        follow: bool,

        /// Stop following after this many pages.
        #[arg(long, default_value_t = 100)]
        max_pages: usize,

        /// Drop any stored cursors before the first page.
        #[arg(long)]
        clear_cache: bool,

        /// Print raw JSON pages instead of tables.
        #[arg(long)]
        json: bool,
    },

    /// List registered backends.
    Backends,

    /// Report hub health as JSON.
    Health,
}

/// Body of `POST /api/query/raw`.
#[derive(Debug, Serialize)]
struct RawQueryBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant: Option<&'a str>,
    result_table_options: &'a ResultTableOptions,
    clear_cache: bool,
}

fn main() {
    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(async_main(cli.command)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn async_main(cmd: Commands) -> Result<(), String> {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("CFX_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());

    match cmd {
        Commands::Query {
            query,
            tenant,
            follow,
            max_pages,
            clear_cache,
            json,
        } => {
            let url = format!("{}/api/query/raw", base_url);
            let mut options = ResultTableOptions::new();
            let mut clear = clear_cache;
            let mut fetched = 0usize;

            loop {
                let body = RawQueryBody {
                    query: &query,
                    tenant: tenant.as_deref(),
                    result_table_options: &options,
                    clear_cache: clear,
                };
                let page = fetch_page(&client, &url, &body).await?;
                fetched += 1;
                clear = false;

                if json {
                    println!("{}", to_pretty(&page));
                } else {
                    println!("{}", render_rows(&page.rows));
                    eprintln!(
                        "page {}: {} rows, total {}, done: {}",
                        fetched,
                        page.rows.len(),
                        page.total,
                        page.done
                    );
                    for key in page.failed_sources() {
                        eprintln!("  failed slice: {}", key);
                    }
                }

                if !follow || page.done || page.result_table_options.is_empty() {
                    break;
                }
                if fetched >= max_pages {
                    eprintln!("Stopped after {} pages.", fetched);
                    break;
                }
                options = page.result_table_options;
            }
        }

        Commands::Backends => {
            let url = format!("{}/api/backends", base_url);
            let resp = get_request(&client, &url).await.map_err(|e| e.to_string())?;
            let backends = resp
                .json::<Vec<serde_json::Value>>()
                .await
                .map_err(|e| e.to_string())?;
            let rows: Vec<RowMap> = backends
                .into_iter()
                .filter_map(|b| b.as_object().cloned())
                .collect();
            println!("{}", render_rows(&rows));
        }

        Commands::Health => {
            let url = format!("{}/api/health", base_url);
            let resp = get_request(&client, &url).await.map_err(|e| e.to_string())?;
            let json = resp
                .json::<serde_json::Value>()
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", to_pretty(&json));
        }
    }

    Ok(())
}

async fn fetch_page(
    client: &reqwest::Client,
    url: &str,
    body: &RawQueryBody<'_>,
) -> Result<PageResponse, String> {
    let resp = post_request(client, url, body)
        .await
        .map_err(|e| e.to_string())?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(format!("{}: {}", status, text));
    }
    resp.json::<PageResponse>().await.map_err(|e| e.to_string())
}

/// Render rows as a table over the union of their columns.
fn render_rows(rows: &[RowMap]) -> String {
    if rows.is_empty() {
        return "(no rows)".to_string();
    }

    let columns = columns_of(rows);
    let mut builder = Builder::default();
    builder.push_record(columns.iter().cloned());
    for row in rows {
        builder.push_record(columns.iter().map(|c| cell(row.get(c))));
    }
    builder.build().with(Style::rounded()).to_string()
}

/// Data columns first in first-seen order, `__` provenance columns last.
fn columns_of(rows: &[RowMap]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut data = Vec::new();
    let mut meta = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                if key.starts_with("__") {
                    meta.push(key.clone());
                } else {
                    data.push(key.clone());
                }
            }
        }
    }
    data.extend(meta);
    data
}

fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn to_pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}

async fn get_request(
    client: &reqwest::Client,
    url: &str,
) -> Result<reqwest::Response, reqwest::Error> {
    client.get(url).send().await
}

async fn post_request<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    json: &T,
) -> Result<reqwest::Response, reqwest::Error> {
    client.post(url).json(json).send().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfx_core::{Continuation, ResultTableOption, SliceStatus};
    use serde_json::json;

    fn row(value: serde_json::Value) -> RowMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columns_put_provenance_last() {
        let rows = vec![
            row(json!({"time": 1, "__result_table": "t", "host": "a"})),
            row(json!({"time": 2, "level": "warn"})),
        ];
        let columns = columns_of(&rows);
        assert_eq!(columns.last().map(String::as_str), Some("__result_table"));
        assert_eq!(columns.len(), 4);
        assert!(columns.contains(&"level".to_string()));
    }

    #[test]
    fn test_render_fills_missing_cells() {
        let rows = vec![
            row(json!({"host": "alpha", "n": 1})),
            row(json!({"host": "beta", "extra": null})),
        ];
        let out = render_rows(&rows);
        assert!(out.contains("alpha"));
        assert!(out.contains("beta"));
        assert!(out.contains("extra"));
        assert_eq!(render_rows(&[]), "(no rows)");
    }

    #[test]
    fn test_request_body_echoes_options() {
        let option = ResultTableOption {
            table_id: "logs".into(),
            connection: "es://a".into(),
            slice_index: 0,
            slice_max: 2,
            continuation: Continuation::Scroll {
                scroll_id: Some("scroll-1".into()),
            },
            status: SliceStatus::Running,
            error: None,
        };
        let mut options = ResultTableOptions::new();
        options.insert(option.key(), option);

        let body = RawQueryBody {
            query: "SELECT * FROM logs SCROLL 1m",
            tenant: None,
            result_table_options: &options,
            clear_cache: false,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("tenant").is_none());
        assert_eq!(value["result_table_options"].as_object().unwrap().len(), 1);
        assert_eq!(value["clear_cache"], json!(false));
    }
}
