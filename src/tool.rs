// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Inspection tool for sediment files.
//!
//! Exit codes: 0 on success, 1 on usage error, `100 + |code|` on engine
//! error.

use clap::{Parser, Subcommand};
use sediment::{CompactOptions, Database, OpenOptions};
use std::ops::ControlFlow;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Inspect and maintain sediment files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print header and index statistics
    Info {
        /// Database file
        file: PathBuf,
    },

    /// List all documents
    Dump {
        /// Database file
        file: PathBuf,

        /// Also print document bodies
        #[arg(long)]
        bodies: bool,
    },

    /// Rewrite the file, dropping garbage
    Compact {
        /// Source database file
        source: PathBuf,

        /// Target file (must not exist)
        target: PathBuf,

        /// Filter out deletion tombstones
        #[arg(long)]
        drop_deletes: bool,
    },
}

fn run(cli: Cli) -> sediment::Result<()> {
    let read_only = OpenOptions {
        read_only: true,
        ..Default::default()
    };

    match cli.command {
        Command::Info { file } => {
            let db = Database::open(&file, read_only)?;

            println!("disk version:   {}", db.disk_version());
            println!("update seq:     {}", db.update_seq());
            println!("purge seq:      {}", db.purge_seq());
            println!("header at:      {}", db.header_position());
            println!("documents:      {}", db.doc_count()?);
            println!("tombstones:     {}", db.deleted_doc_count()?);
        }

        Command::Dump { file, bodies } => {
            let db = Database::open(&file, read_only)?;

            db.all_docs(None, &mut |info| {
                println!(
                    "id={} seq={} rev={} deleted={} size={}",
                    String::from_utf8_lossy(&info.id),
                    info.db_seq,
                    info.rev_seq,
                    info.deleted,
                    info.body_size,
                );

                if bodies && !info.deleted {
                    let doc = db.open_doc_with_docinfo(&info)?;
                    println!("  {}", String::from_utf8_lossy(&doc.body));
                }

                Ok(ControlFlow::Continue(()))
            })?;
        }

        Command::Compact {
            source,
            target,
            drop_deletes,
        } => {
            let db = Database::open(&source, read_only)?;

            db.compact_to(
                &target,
                CompactOptions {
                    drop_deletes,
                    ..Default::default()
                },
            )?;
        }
    }

    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(100 + e.code().unsigned_abs() as i32);
    }
}
