//! shm-ctl — inspect or remove named segments.
//!
//!   shm-ctl [--config <path>] probe <name>
//!   shm-ctl [--config <path>] remove <name>
//!   shm-ctl [--config <path>] sweep
//!
//! `remove` only unlinks the name. Processes still attached keep their
//! mapping; it is the way out when a holder died with the lock held.
//! `sweep` deletes `.shm-stage.*` files left by processes that died while
//! creating a segment.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::config::AppConfig;
use common::types::normalize_segment_name;
use shm::SegmentOptions;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Probe(String),
    Remove(String),
    Sweep,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut rest = args;

    if let Some((flag, tail)) = rest.split_first() {
        if flag == "--config" {
            let (path, tail) = tail.split_first().context("--config needs a path")?;
            config = Some(PathBuf::from(path));
            rest = tail;
        }
    }

    let command = match rest {
        [cmd, name] if cmd == "probe" => Command::Probe(name.clone()),
        [cmd, name] if cmd == "remove" => Command::Remove(name.clone()),
        [cmd] if cmd == "sweep" => Command::Sweep,
        _ => bail!("usage: shm-ctl [--config <path>] <probe|remove> <name> | sweep"),
    };

    Ok(Args { config, command })
}

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;
    let config = AppConfig::load_or_default(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let opts = SegmentOptions::from(&config.segment);

    match args.command {
        Command::Probe(name) => {
            let info = shm::probe::inspect(&opts.dir, &name, opts.lock_timeout)
                .with_context(|| format!("failed to probe segment {}", name))?;
            println!(
                "{}: {} bytes, {} live handles",
                info.name, info.size, info.live_handles
            );
        }
        Command::Remove(name) => {
            let bare = normalize_segment_name(&name)
                .with_context(|| format!("invalid segment name {:?}", name))?;
            if !shm::mmap::shm_exists(&opts.dir, bare) {
                info!("Segment {} not present", bare);
                return Ok(());
            }
            shm::mmap::remove_shm(&opts.dir, bare)
                .with_context(|| format!("failed to remove segment {}", bare))?;
            info!("Segment {} removed", bare);
        }
        Command::Sweep => {
            let removed = shm::mmap::sweep_stale_staging(&opts.dir).with_context(|| {
                format!("failed to sweep staging files in {}", opts.dir.display())
            })?;
            for path in &removed {
                info!("Removed stale staging file {}", path.display());
            }
            println!("{} stale staging files removed", removed.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        let parsed = parse_args(&args(&["probe", "demo"])).unwrap();
        assert_eq!(parsed.config, None);
        assert_eq!(parsed.command, Command::Probe("demo".into()));

        let parsed = parse_args(&args(&["--config", "c.toml", "remove", "/demo"])).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("c.toml")));
        assert_eq!(parsed.command, Command::Remove("/demo".into()));

        let parsed = parse_args(&args(&["sweep"])).unwrap();
        assert_eq!(parsed.command, Command::Sweep);
    }

    #[test]
    fn test_parse_rejects_bad_usage() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
        assert!(parse_args(&args(&["probe"])).is_err());
        assert!(parse_args(&args(&["wipe", "demo"])).is_err());
        assert!(parse_args(&args(&["probe", "a", "b"])).is_err());
        assert!(parse_args(&args(&["sweep", "demo"])).is_err());
    }
}
