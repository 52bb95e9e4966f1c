use liveindex::TableDescriptor;
use liveindex::TableConfig;
use liveindex::checkpoint::loader::{list_checkpoints, load_checkpoint};
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "checkpoint" => match args.get(2).map(String::as_str) {
            Some("list") => cmd_checkpoint_list(&args[3..]),
            Some("verify") => cmd_checkpoint_verify(&args[3..]),
            Some("dump") => cmd_checkpoint_dump(&args[3..]),
            Some(other) => Err(format!("unknown checkpoint command: {other}")),
            None => Err("missing checkpoint subcommand".into()),
        },
        "config" => match args.get(2).map(String::as_str) {
            Some("check") => cmd_config_check(&args[3..]),
            Some(other) => Err(format!("unknown config command: {other}")),
            None => Err("missing config subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_checkpoint_list(args: &[String]) -> Result<(), String> {
    let dir = PathBuf::from(parse_flag_value(args, "--dir").ok_or("--dir is required")?);
    let table = parse_flag_value(args, "--table").ok_or("--table is required")?;
    let files = list_checkpoints(&dir, &table).map_err(|e| format!("list {}: {e}", dir.display()))?;
    for (position, path) in files {
        match load_checkpoint(&path) {
            Ok(checkpoint) => println!(
                "{}\t{}\t{}\t{:016x}",
                path.display(),
                position,
                checkpoint.rows.len(),
                checkpoint.fingerprint
            ),
            Err(err) => println!("{}\tINVALID\t{}", path.display(), err),
        }
    }
    Ok(())
}

fn cmd_checkpoint_verify(args: &[String]) -> Result<(), String> {
    let file = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let checkpoint = load_checkpoint(Path::new(&file)).map_err(|e| format!("load checkpoint: {e}"))?;
    if let Some(config) = parse_flag_value(args, "--config") {
        let descriptor = load_descriptor(Path::new(&config))?;
        if !checkpoint.matches(&descriptor) {
            return Err(format!(
                "checkpoint {file} was taken under another configuration of '{}'",
                descriptor.name
            ));
        }
    }
    println!(
        "ok\t{}\t{}\t{}",
        checkpoint.table,
        checkpoint.position,
        checkpoint.rows.len()
    );
    Ok(())
}

fn cmd_checkpoint_dump(args: &[String]) -> Result<(), String> {
    let file = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let limit = match parse_flag_value(args, "--limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| format!("invalid --limit: {e}"))?,
        None => usize::MAX,
    };
    let checkpoint = load_checkpoint(Path::new(&file)).map_err(|e| format!("load checkpoint: {e}"))?;
    for row in checkpoint.rows.iter().take(limit) {
        let line = serde_json::to_string(&row.values).map_err(|e| format!("encode row: {e}"))?;
        println!("{line}");
    }
    Ok(())
}

fn cmd_config_check(args: &[String]) -> Result<(), String> {
    let file = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let descriptor = load_descriptor(Path::new(&file))?;
    println!("ok\t{}\t{:016x}", descriptor.name, descriptor.fingerprint);
    for col in &descriptor.columns {
        println!(
            "column\t{}\t{}\tsort={}\tfilter={}\tsearch={}",
            col.name,
            col.column_type.as_str(),
            col.sort.map_or("-".to_string(), |k| format!("{k:?}").to_lowercase()),
            col.filter.map_or("-".to_string(), |k| format!("{k:?}").to_lowercase()),
            col.searchable
        );
    }
    Ok(())
}

fn load_descriptor(path: &Path) -> Result<TableDescriptor, String> {
    let raw = fs::read(path).map_err(|e| format!("read {}: {e}", path.display()))?;
    let config: TableConfig =
        serde_json::from_slice(&raw).map_err(|e| format!("parse {}: {e}", path.display()))?;
    TableDescriptor::resolve(&config).map_err(|e| format!("resolve {}: {e}", path.display()))
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  liveindex checkpoint list --dir <checkpoint-dir> --table <table>");
    eprintln!("  liveindex checkpoint verify --file <checkpoint> [--config <table.json>]");
    eprintln!("  liveindex checkpoint dump --file <checkpoint> [--limit <rows>]");
    eprintln!("  liveindex config check --file <table.json>");
}
