use std::fs;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use log::{error, info, LevelFilter};
use pretty_env_logger::env_logger::Builder;

use tagdirfs::cli::{Args, Command};
use tagdirfs::config::Config;
use tagdirfs::fs::bridge::FuseBridge;
use tagdirfs::fs::handler::TagDirFs;
use tagdirfs::ingest::{ingest, IngestOptions};

fn main() -> ExitCode {
    setup_logger();

    match run(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    match args.command {
        Command::Setup { root, force } => {
            if !root.is_dir() {
                error!("backing root {} is not a directory", root.display());
                return Ok(ExitCode::from(1));
            }
            TagDirFs::setup(&root, force)
                .with_context(|| format!("setting up {}", root.display()))?;
            info!("set up backing root {}", root.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Mount {
            mountpoint,
            root,
            cover_mode,
            max_dir_entries,
        } => {
            if fs::metadata(&root).is_err() {
                error!("can't stat root of underlying filesystem");
                return Ok(ExitCode::from(1));
            }
            let fs = TagDirFs::new(Config {
                root,
                cover_mode,
                max_dir_entries,
            })?;
            fuser::mount2(
                FuseBridge::new(fs),
                &mountpoint,
                &[
                    MountOption::AutoUnmount,
                    MountOption::FSName("tagdirfs".to_string()),
                ],
            )?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Ingest {
            source,
            root,
            tags,
            recursive,
            include_hidden_dirs,
            include_hidden_files,
            exclude_dirs,
            tag_by_path,
            include_original_path_prefix,
            tag_by_mime,
        } => {
            if !root.is_dir() {
                error!("backing root {} is not a directory", root.display());
                return Ok(ExitCode::from(1));
            }
            let mut fs = TagDirFs::new(Config {
                root,
                ..Config::default()
            })?;
            let imported = ingest(
                &mut fs,
                &source,
                &IngestOptions {
                    tags,
                    recursive,
                    include_hidden_dirs,
                    include_hidden_files,
                    exclude_dirs,
                    tag_by_path,
                    include_original_path_prefix,
                    tag_by_mime,
                },
            )?;
            info!("imported {imported} files");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn setup_logger() {
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.format_timestamp_secs();
    builder.init();
}
