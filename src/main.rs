use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use sitetrack::config::Config;
use sitetrack::models::{PageHandle, PageInfo, TrackEvent};
use sitetrack::resolve::IP_CACHE_KEY;
use sitetrack::session::{FileSessionStore, MemorySessionStore, SessionStore};
use sitetrack::transport::HttpTransport;
use sitetrack::TrackingContext;

#[derive(Parser)]
#[command(name = "sitetrack")]
#[command(about = "Site event tracking client", long_about = None)]
struct Cli {
    /// URL of the page events are reported for
    #[arg(long, global = true, default_value = "http://localhost/")]
    url: String,

    /// Page title sent with page views and clicks
    #[arg(long, global = true, default_value = "")]
    title: String,

    /// Account identifier; only its SHA-256 digest is sent
    #[arg(long, global = true, default_value = "")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and print the client IP
    Ip,
    /// Resolve and print the backend and proxy domains
    Domains,
    /// Send a page view for --url
    PageView,
    /// Send a custom event
    Track {
        /// Event name
        event_name: String,
        /// Event type
        #[arg(long, default_value = "custom")]
        event_type: String,
        /// Extra field as key=value; values that parse as JSON are sent as JSON
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },
    /// Remove the cached client IP (only when malformed unless --all)
    ClearCache {
        #[arg(long)]
        all: bool,
    },
}

fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("field '{raw}' must look like key=value"))?;
    if key.is_empty() {
        bail!("field '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let session: Arc<dyn SessionStore> = match &config.session_file {
        Some(path) => Arc::new(
            FileSessionStore::open(path)
                .with_context(|| format!("failed to open session file {path}"))?,
        ),
        None => Arc::new(MemorySessionStore::new()),
    };
    let transport = Arc::new(HttpTransport::from_config(&config.http)?);

    let mut info = PageInfo::new(cli.url, config.http.user_agent.clone());
    info.title = cli.title;
    info.account = cli.account;
    let page = PageHandle::new(info);

    let context = TrackingContext::from_config(&config, transport, session.clone(), page);

    match cli.command {
        Commands::Ip => {
            println!("{}", context.ip().client_ip().await);
        }
        Commands::Domains => {
            let domains = context.domains().domains().await?;
            println!("backend: {}", domains.backend_domain);
            if domains.proxy_prefix.is_empty() {
                println!("proxy:   (none)");
            } else {
                println!("proxy:   {}", domains.proxy_prefix);
            }
        }
        Commands::PageView => {
            context.ip().clear_invalid_cache();
            context.track_page_view().await?;
            flush(&context).await?;
            println!("✅ Page view sent");
        }
        Commands::Track {
            event_name,
            event_type,
            fields,
        } => {
            let mut event = TrackEvent::new()
                .with("event_type", event_type)
                .with("event_name", event_name.as_str())
                .with("page_name_lv", "");
            for raw in &fields {
                let (key, value) = parse_field(raw)?;
                event.insert(key, value);
            }

            context.dispatch(event).await?;
            flush(&context).await?;
            println!("✅ Event '{}' sent", event_name);
        }
        Commands::ClearCache { all } => {
            if all {
                session.remove(IP_CACHE_KEY);
                println!("✅ Cached client IP removed");
            } else if context.ip().clear_invalid_cache() {
                println!("✅ Malformed cached client IP removed");
            } else {
                println!("Cached client IP is valid or absent, nothing removed");
            }
        }
    }

    Ok(())
}

async fn flush(context: &TrackingContext) -> Result<()> {
    let client_ip = context.ip().cached();
    context
        .tracker()
        .flush(client_ip.as_deref())
        .await
        .context("failed to deliver tracking batch")?;
    info!(endpoint = %context.tracker().endpoint(), "tracking queue drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_parse_as_json_when_possible() {
        assert_eq!(parse_field("qty=2").unwrap(), ("qty".into(), Value::from(2)));
        assert_eq!(
            parse_field("tab=photos").unwrap(),
            ("tab".into(), Value::from("photos"))
        );
        assert_eq!(
            parse_field("query=a=b").unwrap(),
            ("query".into(), Value::from("a=b"))
        );
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }
}
