mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Number, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use docsync::cache::SqliteMedium;
use docsync::config::Config;
use docsync::document::Fields;
use docsync::engine::{PageView, SyncEngine};
use docsync::remote::HttpGateway;

/// Cross-process cache changes are picked up this often.
const CACHE_WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Mirror a remote document collection into a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/docsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Collection to sync
  #[arg(long)]
  collection: Option<String>,

  /// Documents per page
  #[arg(long)]
  page_size: Option<usize>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print one page of the collection
  List {
    #[arg(long, default_value_t = 1)]
    page: u32,
  },
  /// Create a document
  Add {
    #[arg(long)]
    name: String,
    #[arg(long)]
    price: Number,
    /// Extra field as key=value; the value is parsed as JSON when possible
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, Value)>,
  },
  /// Merge fields into a document
  Update {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    price: Option<Number>,
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, Value)>,
  },
  /// Delete a document
  Delete { id: String },
  /// Follow the collection until interrupted
  Watch,
}

fn parse_field(raw: &str) -> std::result::Result<(String, Value), String> {
  let (key, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
  if key.is_empty() {
    return Err(format!("missing field name in '{}'", raw));
  }
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((key.to_string(), value))
}

fn build_fields(name: Option<String>, price: Option<Number>, extra: Vec<(String, Value)>) -> Fields {
  let mut fields = Fields::new();
  for (key, value) in extra {
    fields.insert(key, value);
  }
  if let Some(name) = name {
    fields.insert("name".into(), Value::String(name));
  }
  if let Some(price) = price {
    fields.insert("price".into(), Value::Number(price));
  }
  fields
}

fn display_value(value: Option<&Value>) -> String {
  match value {
    Some(Value::String(s)) => s.clone(),
    Some(Value::Null) | None => "-".to_string(),
    Some(other) => other.to_string(),
  }
}

fn print_view(view: &PageView) {
  println!("{:<14} {:<28} {:>10}  {}", "ID", "NAME", "PRICE", "UPDATED");
  for doc in &view.documents {
    let updated = chrono::DateTime::from_timestamp(doc.updated_at as i64, 0)
      .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
      .unwrap_or_else(|| doc.updated_at.to_string());
    println!(
      "{:<14} {:<28} {:>10}  {}",
      doc.id,
      display_value(doc.field("name")),
      display_value(doc.field("price")),
      updated
    );
  }
  if view.documents.is_empty() {
    println!("(no documents)");
  }
  println!("Page {}/{}", view.page, view.total_pages);
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let log_dir = if args.log_stderr {
    None
  } else {
    logging::default_log_dir()
  };
  let _log_guard = match logging::init(log_dir.as_deref()) {
    Ok(guard) => guard,
    Err(e) => {
      eprintln!("warning: cannot write log file ({}), logging to stderr", e);
      logging::init(None)?
    }
  };

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(collection) = args.collection {
    config.sync.collection = collection;
  }
  if let Some(page_size) = args.page_size {
    config.sync.page_size = page_size;
  }
  config.sync.validate()?;

  let cache_path = match &config.cache_path {
    Some(path) => path.clone(),
    None => SqliteMedium::default_path()?,
  };
  let medium = Arc::new(SqliteMedium::open(&cache_path)?);
  let gateway = HttpGateway::new(&config.remote.url, Config::get_token())?
    .with_watch_interval(Duration::from_secs(config.remote.watch_interval_secs));

  let engine = SyncEngine::from_config(&config.sync, medium.clone(), Arc::new(gateway))?;
  info!(collection = %engine.collection(), cache = %cache_path.display(), "starting");

  match args.command {
    Command::List { page } => {
      engine.load_cached();
      if let Err(e) = engine.refresh().await {
        warn!(error = %e, "refresh failed, showing cached data");
        eprintln!("warning: remote unavailable, showing cached data ({})", e);
      }
      if page != engine.current_page() && !engine.go_to_page(page).await? {
        return Err(eyre!(
          "page {} is out of range (1-{})",
          page,
          engine.total_pages()
        ));
      }
      print_view(&engine.view());
    }
    Command::Add {
      name,
      price,
      fields,
    } => {
      let id = engine
        .add(build_fields(Some(name), Some(price), fields))
        .await?;
      println!("{}", id);
    }
    Command::Update {
      id,
      name,
      price,
      fields,
    } => {
      let fields = build_fields(name, price, fields);
      if fields.is_empty() {
        return Err(eyre!("nothing to update"));
      }
      engine.update(&id, fields).await?;
      println!("updated {}", id);
    }
    Command::Delete { id } => {
      engine.delete(&id).await?;
      println!("deleted {}", id);
    }
    Command::Watch => {
      let watcher = medium.spawn_watcher(CACHE_WATCH_INTERVAL);
      let mut views = engine.subscribe();
      engine.initialize();
      print_view(&views.borrow_and_update().clone());

      loop {
        tokio::select! {
          changed = views.changed() => {
            if changed.is_err() {
              break;
            }
            let view = views.borrow_and_update().clone();
            println!();
            print_view(&view);
          }
          _ = tokio::signal::ctrl_c() => break,
        }
      }
      watcher.abort();
    }
  }

  engine.teardown();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn field_values_parse_as_json_or_string() {
    assert_eq!(parse_field("stock=3").unwrap(), ("stock".into(), json!(3)));
    assert_eq!(parse_field("tags=[\"a\"]").unwrap(), ("tags".into(), json!(["a"])));
    assert_eq!(parse_field("color=red").unwrap(), ("color".into(), json!("red")));
    assert_eq!(parse_field("note=a=b").unwrap(), ("note".into(), json!("a=b")));
    assert!(parse_field("novalue").is_err());
    assert!(parse_field("=3").is_err());
  }

  #[test]
  fn named_options_override_extra_fields() {
    let fields = build_fields(
      Some("Lamp".into()),
      None,
      vec![("name".into(), json!("ignored")), ("stock".into(), json!(2))],
    );
    assert_eq!(fields.get("name"), Some(&json!("Lamp")));
    assert_eq!(fields.get("stock"), Some(&json!(2)));
    assert!(!fields.contains_key("price"));
  }
}
