use anyhow::{bail, Context, Result};
use arbordb::access::tuple::TupleDesc;
use arbordb::access::value::DataType;
use arbordb::database::Database;
use arbordb::storage::buffer::BufferPoolConfig;
use arbordb::storage::DEFAULT_PAGE_SIZE;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arbordb", about = "Inspect arbordb B+-tree table files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print page and tuple counts for a table file.
    Stats {
        file: PathBuf,
        /// Comma-separated field types: int, long, text.
        #[arg(long, default_value = "int")]
        schema: String,
        /// Index of the key field.
        #[arg(long, default_value_t = 0)]
        key: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
    /// Print every tuple in ascending key order.
    Dump {
        file: PathBuf,
        #[arg(long, default_value = "int")]
        schema: String,
        #[arg(long, default_value_t = 0)]
        key: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
}

fn parse_schema(input: &str) -> Result<TupleDesc> {
    let mut types = Vec::new();
    for part in input.split(',') {
        types.push(match part.trim() {
            "int" | "i32" => DataType::Int32,
            "long" | "i64" => DataType::Int64,
            "text" => DataType::Text,
            other => bail!("unknown field type {other:?} (expected int, long, or text)"),
        });
    }
    Ok(TupleDesc::new(types))
}

fn open_table(
    file: &PathBuf,
    schema: &str,
    key: usize,
    page_size: usize,
) -> Result<(Database, arbordb::access::btree::BTreeFile)> {
    let desc = parse_schema(schema)?;
    let wal_path = file.with_extension("wal");
    let db = Database::new(&wal_path, BufferPoolConfig::default())?;
    let tree = db
        .create_btree_table_with_page_size("table", file, desc, key, page_size)
        .with_context(|| format!("opening {}", file.display()))?;
    Ok((db, tree))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Stats {
            file,
            schema,
            key,
            page_size,
        } => {
            let (db, tree) = open_table(&file, &schema, key, page_size)?;
            let tid = db.begin();
            let mut iter = tree.iterate(tid)?;
            let mut tuples: u64 = 0;
            while iter.advance()?.is_some() {
                tuples += 1;
            }
            let table = db.catalog().resolve(tree.table_id())?;
            println!("file:      {}", file.display());
            println!("page size: {}", table.page_size());
            println!("pages:     {}", table.num_pages()?);
            println!("tuples:    {}", tuples);
            db.commit(tid)?;
        }
        Command::Dump {
            file,
            schema,
            key,
            page_size,
        } => {
            let (db, tree) = open_table(&file, &schema, key, page_size)?;
            let tid = db.begin();
            let mut iter = tree.iterate(tid)?;
            while let Some(tuple) = iter.advance()? {
                println!("{tuple}");
            }
            db.commit(tid)?;
        }
    }
    Ok(())
}
