use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use socialsync::{
  logging, Collection, Config, ExpiringCache, KeyValueStore, SqliteStore, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "socialsync")]
#[command(about = "Inspect and maintain the socialsync offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/socialsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cached collections with record and query counts
  Collections,
  /// Print cached records of a collection as JSON
  Show {
    collection: Collection,
    /// Only this record
    #[arg(long)]
    id: Option<String>,
    /// Include expired records
    #[arg(short, long)]
    all: bool,
  },
  /// Drop a collection from the cache (every collection if omitted)
  Clear { collection: Option<Collection> },
  /// Evict expired records and queries
  Purge { collection: Option<Collection> },
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&Config::data_dir()?.join("logs"), &config.log_level)?;

  let path = config.storage_path()?;
  let mut store = SqliteStore::open(&path)?;
  if let Some(max_bytes) = config.storage.max_bytes {
    store = store.with_max_bytes(max_bytes);
  }
  info!(path = %path.display(), "opened cache");
  let store = Arc::new(store);

  let mut cache = ExpiringCache::new(store.clone(), Arc::new(SystemClock));
  for collection in Collection::ALL {
    cache = cache.with_ttl(collection, config.ttl_for(collection));
  }

  match args.command {
    Command::Collections => {
      list_collections(&cache);
      println!("\nnamespaces on disk: {}", store.namespaces()?.join(", "));
    }
    Command::Show {
      collection,
      id,
      all,
    } => show(&cache, collection, id.as_deref(), all)?,
    Command::Clear { collection } => match collection {
      Some(collection) => {
        cache.clear(collection);
        println!("cleared {}", collection);
      }
      None => {
        cache.clear_all();
        println!("cleared all collections");
      }
    },
    Command::Purge { collection } => {
      let targets = collection.map_or(Collection::ALL.to_vec(), |c| vec![c]);
      for collection in targets {
        let removed = cache.purge_expired(collection);
        println!("{:<14} {} expired record(s) removed", collection, removed);
      }
    }
  }

  if cache.storage_failures() > 0 {
    eprintln!(
      "warning: {} cache storage operation(s) failed, see the log for details",
      cache.storage_failures()
    );
  }
  Ok(())
}

fn list_collections(cache: &ExpiringCache) {
  let now = cache.now();
  println!(
    "{:<14} {:>7} {:>7} {:>7} {:>8}",
    "COLLECTION", "RECORDS", "FRESH", "QUERIES", "TTL"
  );
  for collection in Collection::ALL {
    let entries = cache.entries(collection);
    let fresh = entries.iter().filter(|e| e.is_fresh(now)).count();
    println!(
      "{:<14} {:>7} {:>7} {:>7} {:>7}s",
      collection,
      entries.len(),
      fresh,
      cache.queries(collection).len(),
      cache.ttl(collection).as_secs()
    );
  }
}

fn show(cache: &ExpiringCache, collection: Collection, id: Option<&str>, all: bool) -> Result<()> {
  let now = cache.now();
  let entries: Vec<_> = match id {
    Some(id) => {
      let entry = cache
        .entry(collection, id)
        .ok_or_else(|| eyre!("No cached {} record with id {}", collection, id))?;
      vec![entry]
    }
    None => cache
      .entries(collection)
      .iter()
      .filter(|e| all || e.is_fresh(now))
      .collect(),
  };

  let json = serde_json::to_string_pretty(&entries)
    .map_err(|e| eyre!("Failed to encode {} records: {}", collection, e))?;
  println!("{}", json);
  Ok(())
}
