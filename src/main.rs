use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;

use docktile_lib::activity_log::init_logging;
use docktile_lib::config::{EngineSettings, config_dir};
use docktile_lib::{
    Configuration, EngineHandle, EngineParts, GlyphKind, LayoutMode, MemberItem, TintColor, spawn,
};

#[derive(Debug, Parser)]
#[command(name = "docktile", version, about = "Installable Dock tiles that group apps and folders")]
struct Args {
    /// Settings and tiles.json location (default: platform config dir)
    #[arg(long, env = "DOCKTILE_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Show every tile with its bundle and Dock state
    List {
        /// Also list bundles in the install dir that no tile owns
        #[arg(long)]
        orphans: bool,
    },
    /// Add a tile
    Create {
        name: String,
        /// Preset name (red, blue, ...) or #RRGGBB
        #[arg(long)]
        tint: Option<String>,
        /// SF Symbol name
        #[arg(long, conflicts_with = "emoji")]
        symbol: Option<String>,
        #[arg(long)]
        emoji: Option<String>,
        #[arg(long, value_enum)]
        layout: Option<Layout>,
        /// Application to include (repeatable)
        #[arg(long = "app")]
        apps: Vec<PathBuf>,
        /// Folder to include (repeatable)
        #[arg(long = "folder")]
        folders: Vec<PathBuf>,
        /// Show the tile in the app switcher
        #[arg(long)]
        switcher: bool,
        /// Install right away
        #[arg(long)]
        install: bool,
    },
    /// Build the tile's bundle and add it to the Dock
    Install { tile: String },
    /// Take the tile out of the Dock and delete its bundle
    Uninstall { tile: String },
    /// Uninstall and forget the tile
    Remove { tile: String },
    /// Keep tiles in sync with manual Dock edits until interrupted
    Watch,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Layout {
    Grid,
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _activity = init_logging(args.verbose);

    let dir = args.config_dir.unwrap_or_else(config_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config dir: {}", dir.display()))?;
    let settings = EngineSettings::load(&dir);
    let parts = EngineParts::from_settings(&settings, &dir)?;

    match args.command {
        Cmd::List { orphans } => {
            let stray = orphans.then(|| {
                let known: HashSet<_> = parts
                    .store
                    .configurations()
                    .iter()
                    .map(|c| c.identity.clone())
                    .collect();
                parts.generator.orphans(&known)
            });
            let engine = spawn(parts.without_watcher());
            print_status(&engine).await?;
            for (path, identity) in stray.unwrap_or_default() {
                let identity = identity.map(|i| i.to_string()).unwrap_or_else(|| "?".into());
                println!("orphan  {}  {identity}", path.display());
            }
            engine.shutdown().await?;
        }
        Cmd::Create {
            name,
            tint,
            symbol,
            emoji,
            layout,
            apps,
            folders,
            switcher,
            install,
        } => {
            let engine = spawn(parts.without_watcher());
            let mut cfg = engine.create(&name).await?;
            if let Some(tint) = tint {
                cfg.icon.tint = TintColor::try_from(tint).map_err(anyhow::Error::msg)?;
            }
            if let Some(symbol) = symbol {
                cfg.icon.glyph_kind = GlyphKind::Symbol;
                cfg.icon.glyph_value = symbol;
            }
            if let Some(emoji) = emoji {
                cfg.icon.glyph_kind = GlyphKind::Emoji;
                cfg.icon.glyph_value = emoji;
            }
            if let Some(layout) = layout {
                cfg.layout_mode = match layout {
                    Layout::Grid => LayoutMode::Grid,
                    Layout::List => LayoutMode::List,
                };
            }
            cfg.member_items
                .extend(apps.into_iter().map(|p| MemberItem::app(item_name(&p), p)));
            cfg.member_items
                .extend(folders.into_iter().map(|p| MemberItem::folder(item_name(&p), p)));
            cfg.wants_switcher_visible = switcher;

            let cfg = engine.update(cfg).await?.configuration;
            println!("{}  {}", cfg.id, cfg.identity);
            if install {
                let path = engine.install(cfg.id).await?;
                println!("installed {}", path.display());
            }
            engine.shutdown().await?;
        }
        Cmd::Install { tile } => {
            let engine = spawn(parts.without_watcher());
            let cfg = find_tile(&engine, &tile).await?;
            let path = engine.install(cfg.id).await?;
            println!("installed {}", path.display());
            engine.shutdown().await?;
        }
        Cmd::Uninstall { tile } => {
            let engine = spawn(parts.without_watcher());
            let cfg = find_tile(&engine, &tile).await?;
            engine.uninstall(cfg.id).await?;
            println!("uninstalled {}", cfg.display_name);
            engine.shutdown().await?;
        }
        Cmd::Remove { tile } => {
            let engine = spawn(parts.without_watcher());
            let cfg = find_tile(&engine, &tile).await?;
            engine.remove(cfg.id).await?;
            println!("removed {}", cfg.display_name);
            engine.shutdown().await?;
        }
        Cmd::Watch => {
            let engine = spawn(parts);
            print_status(&engine).await?;
            tracing::info!("Watching for Dock changes, Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            engine.shutdown().await?;
        }
    }
    Ok(())
}

async fn print_status(engine: &EngineHandle) -> Result<()> {
    for status in engine.status().await? {
        let cfg = &status.configuration;
        let marker = match (cfg.wants_visible, status.in_dock) {
            (true, true) => "docked",
            (true, false) => "missing",
            (false, _) => "hidden",
        };
        let installed = status
            .installed_at
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".into());
        println!("{marker:<8} {:<24} {}  {installed}", cfg.display_name, cfg.identity);
    }
    Ok(())
}

/// Match a tile by id, identity or exact name.
async fn find_tile(engine: &EngineHandle, query: &str) -> Result<Configuration> {
    let tiles = engine.snapshot().await?;
    let mut matches = tiles.into_iter().filter(|c| {
        c.id.to_string() == query || c.identity.as_str() == query || c.display_name == query
    });
    let Some(first) = matches.next() else {
        bail!("no tile matches {query:?}");
    };
    if matches.next().is_some() {
        bail!("{query:?} matches more than one tile; use its id");
    }
    Ok(first)
}

fn item_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
