use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use wzarchive::archive::{Archive, ArchiveConfig, ArchiveOptions};
use wzarchive::obfuscation;
use wzarchive::scan;
use wzarchive::tree::{NodeId, NodeKind, NodeValue, PropertyTree};

#[derive(Parser)]
#[command(name = "wzkit", about = "Inspect and rewrite WZ property archives")]
struct Cli {
    /// JSON file with archive options (version, list entries, ...)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Client version; probed when omitted
    #[arg(long = "wz-version", global = true)]
    wz_version: Option<u16>,
    /// Report links as their paths instead of following them
    #[arg(long, global = true)]
    no_links: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show archive metadata
    Info {
        input: PathBuf,
    },
    /// List directories and images
    List {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print one node
    Get {
        input: PathBuf,
        /// Path below the archive root, e.g. 0100100.img/info/speed
        path:  String,
    },
    /// Dump a subtree as JSON
    Export {
        input: PathBuf,
        path:  String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write decoded canvases as raw RGBA files into this directory
        #[arg(long)]
        pixels: Option<PathBuf>,
    },
    /// Decode every canvas and report problems
    Scan {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Parse everything and write the archive back out
    Resave {
        input:  PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Version to write; defaults to the input's
        #[arg(long)]
        target_version: Option<u16>,
        /// Remove list-mode obfuscation from every image
        #[arg(long)]
        strip_list: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let opts = build_options(&cli)?;

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let ar = Archive::open(&input, opts)?;
            let entries = ar.entries();
            let images = entries.iter().filter(|e| e.kind == NodeKind::Image).count();
            let vh = ar.version_hash();
            println!("── WZ Archive ───────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Copyright      {}", ar.header().copyright);
            println!("  Data start     {}", ar.header().data_start);
            println!("  Data size      {} B", ar.header().data_size);
            println!("  Version        {} (stored {:#06x}, hash {:#010x})", vh.version, vh.encrypted_version, vh.hash);
            println!("  Directories    {}", entries.len() - images);
            println!("  Images         {}", images);
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let ar = Archive::open(&input, opts)?;
            let entries = ar.entries();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{:<48} {:>9} {:>10} {:>11}  List", "Path", "Kind", "Size", "Checksum");
                for e in &entries {
                    println!("{:<48} {:>9} {:>10} {:>11}  {}",
                        e.path, e.kind.name(), e.size, e.checksum, if e.list_mode { "yes" } else { "" });
                }
            }
        }

        // ── Get ──────────────────────────────────────────────────────────────
        Commands::Get { input, path } => {
            let mut ar = Archive::open(&input, opts)?;
            let id = lookup(&mut ar, &path)?;
            let tree = ar.tree();
            println!("{} ({})", tree.full_path(id), tree.kind(id).map(|k| k.name()).unwrap_or("?"));
            println!("{}", describe(tree, id));
            for &c in tree.children(id) {
                println!("  {:<32} {}", tree.name(c).unwrap_or_default(), describe(tree, c));
            }
        }

        // ── Export ───────────────────────────────────────────────────────────
        Commands::Export { input, path, output, pixels } => {
            let mut ar = Archive::open(&input, opts)?;
            let id = lookup(&mut ar, &path)?;
            for n in ar.tree().walk(id) {
                ar.tree_mut().parse_image(n)?;
            }
            let dump = to_json(ar.tree(), id);
            let text = serde_json::to_string_pretty(&dump)?;
            match output {
                Some(out) => std::fs::write(&out, text)?,
                None => println!("{text}"),
            }
            if let Some(dir) = pixels {
                let written = export_pixels(ar.tree(), id, &dir)?;
                eprintln!("Wrote {written} canvas(es) to {}", dir.display());
            }
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input, json } => {
            let mut ar = Archive::open(&input, opts)?;
            let mut last = 0;
            let mut progress = |done: usize, total: usize| {
                let pct = done * 100 / total.max(1);
                if pct >= last + 10 {
                    last = pct;
                    eprintln!("  {pct:>3}% ({done}/{total} images)");
                }
            };
            let report = scan::scan(&mut ar, Some(&mut progress))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
                for f in &report.image_failures {
                    println!("  image   {}: {}", f.path, f.reason);
                }
                for r in report.canvas_log.iter().filter(|r| !r.health.is_usable()) {
                    println!("  canvas  {} ({}x{}, format {}): {:?}", r.path, r.width, r.height, r.format, r.health);
                }
            }
        }

        // ── Resave ───────────────────────────────────────────────────────────
        Commands::Resave { input, output, target_version, strip_list } => {
            let mut ar = Archive::open(&input, opts)?;
            let parsed = ar.parse_all()?;
            if strip_list {
                let root = ar.root();
                let n = obfuscation::strip_secondary(ar.tree_mut(), root)?;
                eprintln!("Stripped list mode from {n} canvas(es)");
            }
            if let Some(v) = target_version {
                ar.set_version(v);
            }
            ar.save(&output)?;
            println!("Resaved {} image(s) → {}", parsed, output.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn build_options(cli: &Cli) -> Result<ArchiveOptions, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ArchiveConfig::load(path)?,
        None => ArchiveConfig::default(),
    };
    if cli.wz_version.is_some() {
        config.version = cli.wz_version;
    }
    if cli.no_links {
        config.resolve_links = false;
    }
    Ok(config.into_options())
}

fn lookup(ar: &mut Archive, path: &str) -> Result<NodeId, Box<dyn std::error::Error>> {
    ar.get(path)?
        .ok_or_else(|| format!("No node at '{path}'").into())
}

fn describe(tree: &PropertyTree, id: NodeId) -> String {
    match tree.value(id) {
        Some(NodeValue::Canvas(c)) => format!("canvas {}x{} format {}", c.width, c.height, c.format),
        Some(NodeValue::Vector { x, y }) => format!("({x}, {y})"),
        Some(NodeValue::Link(l)) => match tree.get_string(id) {
            Some(v) if tree.resolve_links => format!("-> {} = {v}", l.path()),
            _ => format!("-> {}", l.path()),
        },
        Some(NodeValue::Opaque { type_name, bytes }) => format!("<{type_name}, {} bytes>", bytes.len()),
        Some(NodeValue::Null) => "null".into(),
        Some(v) if v.kind().is_container() => format!("{} children", tree.children(id).len()),
        Some(_) => tree.get_string(id).unwrap_or_default(),
        None => "<missing>".into(),
    }
}

fn to_json(tree: &PropertyTree, id: NodeId) -> Value {
    let children = || {
        let mut map = Map::new();
        for &c in tree.children(id) {
            if let Some(name) = tree.name(c) {
                map.insert(name.to_owned(), to_json(tree, c));
            }
        }
        map
    };
    match tree.value(id) {
        Some(NodeValue::Short(v)) => json!(v),
        Some(NodeValue::Int(v)) => json!(v),
        Some(NodeValue::Long(v)) => json!(v),
        Some(NodeValue::Float(v)) => json!(v),
        Some(NodeValue::Double(v)) => json!(v),
        Some(NodeValue::String(s)) => json!(s),
        Some(NodeValue::Vector { x, y }) => json!([x, y]),
        Some(NodeValue::Link(l)) => json!({ "_link": l.path() }),
        Some(NodeValue::Opaque { type_name, bytes }) => json!({ "_type": type_name, "_bytes": bytes.len() }),
        Some(NodeValue::Canvas(c)) => {
            let mut map = children();
            map.insert("_canvas".into(), json!({ "width": c.width, "height": c.height, "format": c.format }));
            Value::Object(map)
        }
        Some(NodeValue::Null) | None => Value::Null,
        Some(_) => Value::Object(children()),
    }
}

fn export_pixels(tree: &PropertyTree, id: NodeId, dir: &Path) -> Result<usize, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    let mut written = 0;
    for n in tree.walk(id) {
        if !matches!(tree.value(n), Some(NodeValue::Canvas(_))) {
            continue;
        }
        let Some(raster) = tree.decode_canvas(n)? else { continue };
        let file = tree.full_path(n).replace(['/', '\\'], "_");
        let out = dir.join(format!("{file}.{}x{}.rgba", raster.width, raster.height));
        std::fs::write(&out, raster.to_rgba())?;
        written += 1;
    }
    Ok(written)
}
